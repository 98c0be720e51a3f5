//! Opcode table for the supported pickle subset.
//!
//! Each variant's discriminant is its byte in the stream, so dispatch is a
//! single table lookup followed by a `match` in the stack machine.

/// A pickle instruction tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // Stack and mark manipulation
    Mark = b'(',
    Stop = b'.',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',

    // Scalars
    None = b'N',
    NewTrue = 0x88,
    NewFalse = 0x89,
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long = b'L',
    Long1 = 0x8a,
    Long4 = 0x8b,
    Float = b'F',
    BinFloat = b'G',
    String = b'S',
    BinString = b'T',
    ShortBinString = b'U',
    BinBytes = b'B',
    ShortBinBytes = b'C',
    Unicode = b'V',
    BinUnicode = b'X',

    // Containers
    EmptyTuple = b')',
    Tuple = b't',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    EmptyList = b']',
    List = b'l',
    Append = b'a',
    Appends = b'e',
    EmptyDict = b'}',
    Dict = b'd',
    SetItem = b's',
    SetItems = b'u',

    // Classes and instances
    Global = b'c',
    Inst = b'i',
    Obj = b'o',
    Reduce = b'R',
    NewObj = 0x81,
    Build = b'b',

    // External references
    PersId = b'P',
    BinPersId = b'Q',

    // Memo
    Put = b'p',
    BinPut = b'q',
    LongBinPut = b'r',
    Get = b'g',
    BinGet = b'h',
    LongBinGet = b'j',

    // Framing
    Proto = 0x80,
}

/// Byte-indexed lookup table, built once at compile time.
static TABLE: [Option<Opcode>; 256] = build_table();

const ALL: [Opcode; 52] = [
    Opcode::Mark,
    Opcode::Stop,
    Opcode::Pop,
    Opcode::PopMark,
    Opcode::Dup,
    Opcode::None,
    Opcode::NewTrue,
    Opcode::NewFalse,
    Opcode::Int,
    Opcode::BinInt,
    Opcode::BinInt1,
    Opcode::BinInt2,
    Opcode::Long,
    Opcode::Long1,
    Opcode::Long4,
    Opcode::Float,
    Opcode::BinFloat,
    Opcode::String,
    Opcode::BinString,
    Opcode::ShortBinString,
    Opcode::BinBytes,
    Opcode::ShortBinBytes,
    Opcode::Unicode,
    Opcode::BinUnicode,
    Opcode::EmptyTuple,
    Opcode::Tuple,
    Opcode::Tuple1,
    Opcode::Tuple2,
    Opcode::Tuple3,
    Opcode::EmptyList,
    Opcode::List,
    Opcode::Append,
    Opcode::Appends,
    Opcode::EmptyDict,
    Opcode::Dict,
    Opcode::SetItem,
    Opcode::SetItems,
    Opcode::Global,
    Opcode::Inst,
    Opcode::Obj,
    Opcode::Reduce,
    Opcode::NewObj,
    Opcode::Build,
    Opcode::PersId,
    Opcode::BinPersId,
    Opcode::Put,
    Opcode::BinPut,
    Opcode::LongBinPut,
    Opcode::Get,
    Opcode::BinGet,
    Opcode::LongBinGet,
    Opcode::Proto,
];

const fn build_table() -> [Option<Opcode>; 256] {
    let mut table = [None; 256];
    let mut i = 0;
    while i < ALL.len() {
        let op = ALL[i];
        table[op as u8 as usize] = Some(op);
        i += 1;
    }
    table
}

impl Opcode {
    /// Looks up the opcode for a stream byte.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        TABLE[byte as usize]
    }

    /// The byte this opcode is encoded as.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_bytes_round_trip() {
        for op in ALL {
            assert_eq!(Opcode::from_byte(op.byte()), Some(op));
        }
    }

    #[test]
    fn test_unknown_bytes() {
        // EXT1 and FRAME are deliberately unsupported.
        assert_eq!(Opcode::from_byte(0x82), None);
        assert_eq!(Opcode::from_byte(0x95), None);
        assert_eq!(Opcode::from_byte(b'z'), None);
    }
}
