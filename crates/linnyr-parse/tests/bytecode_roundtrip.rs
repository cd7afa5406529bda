//! Bytecode survives a serialization round trip (requires the `serde`
//! feature).
#![cfg(feature = "serde")]

use linnyr_parse::{compiler, EntityKind, EntityRef, Instr};

#[test]
fn compiled_bytecode_round_trips() {
    let owner = EntityRef::new(EntityKind::Dataset, "d");
    let texts = [
        "1 + 2 * [demand|LB@t-1]",
        "(max(1; 2; [x])) | 0",
        "t > 3 ? [p|UB] : 0",
    ];
    for text in texts {
        let compiled = compiler::compile(text, &owner, "m");
        assert!(compiled.compile_issue.is_none(), "{text}");
        let json = serde_json::to_string(&compiled.code).unwrap();
        let back: Vec<Instr> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, compiled.code, "{text}");
    }
}
