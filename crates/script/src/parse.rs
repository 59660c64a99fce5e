//! Low-level script tokenizer shared by the interpreter and script analysis.

use crate::opcodes::{OP_0, OP_16, OP_CODESEPARATOR, OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4};

/// One decoded script element; `data` is empty for non-push opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPush;

/// Reads the element at `*pc` and advances past it.
pub fn read_instruction<'a>(
    script: &'a [u8],
    pc: &mut usize,
) -> Result<Instruction<'a>, TruncatedPush> {
    let opcode = *script.get(*pc).ok_or(TruncatedPush)?;
    *pc += 1;
    let len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => read_len::<1>(script, pc)?,
        OP_PUSHDATA2 => read_len::<2>(script, pc)?,
        OP_PUSHDATA4 => read_len::<4>(script, pc)?,
        _ => 0,
    };
    let end = pc.checked_add(len).ok_or(TruncatedPush)?;
    if end > script.len() {
        return Err(TruncatedPush);
    }
    let data = &script[*pc..end];
    *pc = end;
    Ok(Instruction { opcode, data })
}

fn read_len<const N: usize>(script: &[u8], pc: &mut usize) -> Result<usize, TruncatedPush> {
    let end = *pc + N;
    if end > script.len() {
        return Err(TruncatedPush);
    }
    let mut buf = [0u8; 4];
    buf[..N].copy_from_slice(&script[*pc..end]);
    *pc = end;
    Ok(u32::from_le_bytes(buf) as usize)
}

/// Iterates script elements, yielding an error once and stopping on a truncated push.
pub struct Instructions<'a> {
    script: &'a [u8],
    pc: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            pc: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, TruncatedPush>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc >= self.script.len() {
            return None;
        }
        let item = read_instruction(self.script, &mut self.pc);
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Parses the whole script, failing on any truncated push.
pub fn parse_script(script: &[u8]) -> Result<Vec<Instruction<'_>>, TruncatedPush> {
    Instructions::new(script).collect()
}

pub fn is_push_only(script: &[u8]) -> bool {
    for item in Instructions::new(script) {
        match item {
            // OP_RESERVED sits below OP_16 and counts as a push here.
            Ok(instruction) if instruction.opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

/// Canonical push of `data`, as produced by a script builder.
pub fn push_data_script(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    push_data(&mut out, data);
    out
}

pub fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
}

/// Whether `data` was pushed with the smallest possible opcode.
pub fn is_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        return false;
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

/// Removes every occurrence of `pattern` that starts on an opcode boundary.
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut result = Vec::with_capacity(script.len());
    let mut pc = 0usize;
    let mut kept_from = 0usize;
    let mut found = false;
    loop {
        result.extend_from_slice(&script[kept_from..pc]);
        while script.len() - pc >= pattern.len() && &script[pc..pc + pattern.len()] == pattern {
            pc += pattern.len();
            found = true;
        }
        kept_from = pc;
        if pc >= script.len() || read_instruction(script, &mut pc).is_err() {
            break;
        }
    }
    if !found {
        return script.to_vec();
    }
    result.extend_from_slice(&script[kept_from..]);
    result
}

/// Drops `OP_CODESEPARATOR` opcodes, keeping everything else byte-for-byte.
pub fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0usize;
    while pc < script.len() {
        let start = pc;
        match read_instruction(script, &mut pc) {
            Ok(instruction) if instruction.opcode == OP_CODESEPARATOR => {}
            Ok(_) => out.extend_from_slice(&script[start..pc]),
            Err(_) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}
