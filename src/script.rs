//! Script inspection needed by consensus: opcode parsing, signature
//! operation counting and coinbase height encoding. Execution is delegated
//! to a [`ScriptVerifier`](crate::verify::ScriptVerifier).

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// One parsed instruction: the opcode and, for pushes, the pushed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

/// Iterator over the instructions of a script. Yields `Err(())` once on a
/// truncated push and then stops.
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
    failed: bool,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions {
        script,
        pos: 0,
        failed: false,
    }
}

impl<'a> Instructions<'a> {
    fn read_len(&mut self, width: usize) -> Option<usize> {
        let bytes = self.script.get(self.pos..self.pos + width)?;
        self.pos += width;
        let mut buf = [0u8; 4];
        buf[..width].copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.pos];
        self.pos += 1;

        let len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => self.read_len(1),
            OP_PUSHDATA2 => self.read_len(2),
            OP_PUSHDATA4 => self.read_len(4),
            _ => return Some(Ok(Instruction { opcode, data: &[] })),
        };

        let data = len.and_then(|len| {
            let end = self.pos.checked_add(len)?;
            let data = self.script.get(self.pos..end)?;
            self.pos = end;
            Some(data)
        });

        match data {
            Some(data) => Some(Ok(Instruction { opcode, data })),
            None => {
                self.failed = true;
                Some(Err(()))
            }
        }
    }
}

fn decode_small_int(opcode: u8) -> Option<u32> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(u32::from(opcode - OP_1 + 1)),
        _ => None,
    }
}

/// Signature operations in a script. With `accurate`, multisig counts use the
/// preceding small-integer key count instead of the worst case.
pub fn sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0;
    let mut last_opcode = 0xff;
    for instruction in instructions(script) {
        let Ok(instruction) = instruction else { break };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match decode_small_int(last_opcode) {
                    Some(n) if accurate && last_opcode != OP_0 => n,
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last_opcode = instruction.opcode;
    }
    count
}

pub fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|i| matches!(i, Ok(i) if i.opcode <= OP_16))
}

/// Signature operations in the redeem script of a pay-to-script-hash spend.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    let mut redeem: &[u8] = &[];
    for instruction in instructions(script_sig) {
        match instruction {
            Ok(i) if i.opcode <= OP_16 => redeem = i.data,
            _ => return 0,
        }
    }
    sigop_count(redeem, true)
}

/// Outputs that can never be spent are kept out of the coin set.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

/// Minimal script-number encoding: little-endian magnitude with the sign in
/// the top bit of the last byte.
pub fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut out = Vec::new();
    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

/// Script fragment a coinbase must start with to commit to its height.
pub fn coinbase_height_script(height: u32) -> Vec<u8> {
    match height {
        0 => vec![OP_0],
        1..=16 => vec![OP_1 + (height as u8) - 1],
        _ => {
            let num = encode_script_num(i64::from(height));
            let mut script = Vec::with_capacity(num.len() + 1);
            script.push(num.len() as u8);
            script.extend_from_slice(&num);
            script
        }
    }
}
