//! Script parsing, verification, sighash and sigop accounting.

pub mod interpreter;
pub mod num;
pub mod opcodes;
pub mod parse;
pub mod secp;
pub mod sighash;
pub mod sigops;
pub mod standard;

pub use interpreter::{
    verify_script, ScriptError, ScriptFlags, TransactionSignatureChecker,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
pub use sighash::{SighashCache, SighashType, SigVersion};
