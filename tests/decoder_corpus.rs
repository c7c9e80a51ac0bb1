//! Golden-fixture coverage for the decoder: each entry pairs a raw
//! instruction word with the mnemonic family `decode()` is expected to
//! recognize it as.

use kernel_call::aarch64::{decode, Instruction, LogicalOp, MovVariant};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Entry {
    word: String,
    pc: String,
    mnemonic: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    imm: Option<i64>,
    #[serde(default)]
    load: Option<bool>,
    #[serde(default)]
    writeback: Option<bool>,
    #[serde(default)]
    post_index: Option<bool>,
}

fn parse_hex(s: &str) -> u64 {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap()
}

#[test]
fn decoder_corpus_matches_golden_fixture() {
    let raw = std::fs::read_to_string("tests/fixtures/decoder_corpus.json").unwrap();
    let entries: Vec<Entry> = serde_json::from_str(&raw).unwrap();

    for entry in entries {
        let word = parse_hex(&entry.word) as u32;
        let pc = parse_hex(&entry.pc);
        let ins = decode(word, pc).unwrap_or_else(|| panic!("{} failed to decode", entry.word));

        match entry.mnemonic.as_str() {
            "nop" => assert_eq!(ins, Instruction::Nop),
            "ret" => assert!(matches!(ins, Instruction::BranchRegister { ret: true, .. })),
            "movz" => assert!(matches!(
                ins,
                Instruction::MovWide { variant: MovVariant::Movz, .. }
            )),
            "bl" => match ins {
                Instruction::Branch { link, target } => {
                    assert!(link);
                    assert_eq!(target, parse_hex(entry.target.as_ref().unwrap()));
                }
                other => panic!("expected Branch, got {other:?}"),
            },
            "mov" => {
                assert!(matches!(ins, Instruction::LogicalShiftedReg { .. }));
                assert!(ins.is_mov_register());
            }
            "add_imm" => match ins {
                Instruction::AddSubImmediate { add, imm, .. } => {
                    assert!(add);
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected AddSubImmediate, got {other:?}"),
            },

            "ldp" => match ins {
                Instruction::LoadStorePair { load, writeback, imm, .. } => {
                    assert_eq!(load, entry.load.unwrap());
                    assert_eq!(writeback, entry.writeback.unwrap());
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LoadStorePair, got {other:?}"),
            },
            "stp" => match ins {
                Instruction::LoadStorePair { load, writeback, imm, .. } => {
                    assert_eq!(load, entry.load.unwrap());
                    assert_eq!(writeback, entry.writeback.unwrap());
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LoadStorePair, got {other:?}"),
            },

            "ldr_unsigned" | "str_unsigned" => match ins {
                Instruction::LoadStoreImmediate { load, writeback, post_index, imm, .. } => {
                    assert_eq!(load, entry.load.unwrap());
                    assert!(!writeback);
                    assert!(!post_index);
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LoadStoreImmediate, got {other:?}"),
            },
            "ldr_post_index" => match ins {
                Instruction::LoadStoreImmediate { load, writeback, post_index, imm, .. } => {
                    assert_eq!(load, entry.load.unwrap());
                    assert!(writeback);
                    assert_eq!(post_index, entry.post_index.unwrap());
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LoadStoreImmediate, got {other:?}"),
            },
            "ldr_register_offset" => {
                assert!(matches!(ins, Instruction::LoadStoreRegister { load: true, .. }))
            }

            "adrp" => match ins {
                Instruction::Adr { is_adrp, target, .. } => {
                    assert!(is_adrp);
                    assert_eq!(target, parse_hex(entry.target.as_ref().unwrap()));
                }
                other => panic!("expected Adr, got {other:?}"),
            },
            "adr" => match ins {
                Instruction::Adr { is_adrp, target, .. } => {
                    assert!(!is_adrp);
                    assert_eq!(target, parse_hex(entry.target.as_ref().unwrap()));
                }
                other => panic!("expected Adr, got {other:?}"),
            },

            "cbz" => match ins {
                Instruction::CompareAndBranch { nonzero, target, .. } => {
                    assert!(!nonzero);
                    assert_eq!(target, parse_hex(entry.target.as_ref().unwrap()));
                }
                other => panic!("expected CompareAndBranch, got {other:?}"),
            },
            "cbnz" => match ins {
                Instruction::CompareAndBranch { nonzero, target, .. } => {
                    assert!(nonzero);
                    assert_eq!(target, parse_hex(entry.target.as_ref().unwrap()));
                }
                other => panic!("expected CompareAndBranch, got {other:?}"),
            },

            "and_imm" => match ins {
                Instruction::LogicalImmediate { op, imm, .. } => {
                    assert_eq!(op, LogicalOp::And);
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LogicalImmediate, got {other:?}"),
            },
            "orr_imm" => match ins {
                Instruction::LogicalImmediate { op, imm, .. } => {
                    assert_eq!(op, LogicalOp::Orr);
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LogicalImmediate, got {other:?}"),
            },
            "eor_imm" => match ins {
                Instruction::LogicalImmediate { op, imm, .. } => {
                    assert_eq!(op, LogicalOp::Eor);
                    assert_eq!(imm as i64, entry.imm.unwrap());
                }
                other => panic!("expected LogicalImmediate, got {other:?}"),
            },
            "mov_bitmask" => {
                assert!(matches!(ins, Instruction::LogicalImmediate { op: LogicalOp::Orr, .. }));
                assert!(ins.is_mov_bitmask());
            }

            "cmp_imm" => assert!(ins.is_cmn_or_cmp()),
            "tst_imm" => assert!(ins.is_tst()),
            "neg" => assert!(ins.is_neg_or_negs()),
            "mov_sp" => assert!(ins.is_mov_to_or_from_sp()),

            other => panic!("fixture names an unknown mnemonic: {other}"),
        }
    }
}
