//! Encapsulates a list of "soft error"s.
//!
//! A "soft error" is an error that is encountered while running a
//! best-effort scan that doesn't totally prevent the scan from being
//! useful, but it may mean some entries are missing. The vtable/metaclass
//! finder is best-effort and reports success even if it discovers
//! nothing, and the gadget scanner reports missing entries by name rather
//! than failing outright; both return one of these alongside their normal
//! result, instead of aborting on the first failed candidate.

use serde::Serialize;

/// Holds a list of soft errors. See module-level docs.
#[derive(Debug)]
pub struct SoftErrorList<E> {
    errors: Vec<E>,
}

impl<E> SoftErrorList<E> {
    /// Returns true if there are no errors in the list.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
    /// Returns the number of errors in the list.
    pub fn len(&self) -> usize {
        self.errors.len()
    }
    /// Adds a new error to the end of the list.
    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }
    /// Immutable iteration of the list items.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.errors.iter()
    }
}

impl<E: Serialize> SoftErrorList<E> {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl<E: Serialize> Serialize for SoftErrorList<E> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.errors.serialize(serializer)
    }
}

impl<E> Default for SoftErrorList<E> {
    fn default() -> Self {
        Self { errors: Vec::new() }
    }
}

impl<E: std::error::Error> std::fmt::Display for SoftErrorList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "one or more soft errors occurred:")?;
        writeln!(f)?;
        for (i, e) in self.errors.iter().enumerate() {
            writeln!(f, "  {i}:")?;
            for line in e.to_string().lines() {
                writeln!(f, "    {line}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error> std::error::Error for SoftErrorList<E> {}

impl<E> IntoIterator for SoftErrorList<E> {
    type Item = <Vec<E> as IntoIterator>::Item;
    type IntoIter = <Vec<E> as IntoIterator>::IntoIter;
    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error, Serialize)]
    #[error("missing gadget {0}")]
    struct MissingGadget(String);

    #[test]
    fn accumulates_without_aborting() {
        let mut list = SoftErrorList::default();
        assert!(list.is_empty());
        list.push(MissingGadget("ldp x2, x1, [x1] ; br x2".into()));
        list.push(MissingGadget("str x0, [x20] ; ...".into()));
        assert_eq!(list.len(), 2);
        let rendered = list.to_string();
        assert!(rendered.contains("ldp x2, x1"));
    }
}
