/// Metamethod slots.
///
/// Classes carry one slot per variant; tables and userdata resolve the
/// same names through their delegate table. The discriminant indexes the
/// class slot array and the shared metamethod-name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaMethod {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Unm = 4,
    Modulo = 5,
    Set = 6,
    Get = 7,
    TypeOf = 8,
    NextI = 9,
    Cmp = 10,
    Call = 11,
    Cloned = 12,
    NewSlot = 13,
    DelSlot = 14,
    ToString = 15,
    NewMember = 16,
    Inherited = 17,
}

/// Number of metamethod slots.
pub const MM_COUNT: usize = 18;

impl MetaMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MetaMethod::Add),
            1 => Some(MetaMethod::Sub),
            2 => Some(MetaMethod::Mul),
            3 => Some(MetaMethod::Div),
            4 => Some(MetaMethod::Unm),
            5 => Some(MetaMethod::Modulo),
            6 => Some(MetaMethod::Set),
            7 => Some(MetaMethod::Get),
            8 => Some(MetaMethod::TypeOf),
            9 => Some(MetaMethod::NextI),
            10 => Some(MetaMethod::Cmp),
            11 => Some(MetaMethod::Call),
            12 => Some(MetaMethod::Cloned),
            13 => Some(MetaMethod::NewSlot),
            14 => Some(MetaMethod::DelSlot),
            15 => Some(MetaMethod::ToString),
            16 => Some(MetaMethod::NewMember),
            17 => Some(MetaMethod::Inherited),
            _ => None,
        }
    }

    /// The slot name as it appears to scripts.
    pub const fn name(self) -> &'static str {
        match self {
            MetaMethod::Add => "_add",
            MetaMethod::Sub => "_sub",
            MetaMethod::Mul => "_mul",
            MetaMethod::Div => "_div",
            MetaMethod::Unm => "_unm",
            MetaMethod::Modulo => "_modulo",
            MetaMethod::Set => "_set",
            MetaMethod::Get => "_get",
            MetaMethod::TypeOf => "_typeof",
            MetaMethod::NextI => "_nexti",
            MetaMethod::Cmp => "_cmp",
            MetaMethod::Call => "_call",
            MetaMethod::Cloned => "_cloned",
            MetaMethod::NewSlot => "_newslot",
            MetaMethod::DelSlot => "_delslot",
            MetaMethod::ToString => "_tostring",
            MetaMethod::NewMember => "_newmember",
            MetaMethod::Inherited => "_inherited",
        }
    }

    /// Reverse lookup used when a class slot is created: a member whose
    /// name matches a metamethod installs into the slot array instead of
    /// the member table.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "_add" => Some(MetaMethod::Add),
            "_sub" => Some(MetaMethod::Sub),
            "_mul" => Some(MetaMethod::Mul),
            "_div" => Some(MetaMethod::Div),
            "_unm" => Some(MetaMethod::Unm),
            "_modulo" => Some(MetaMethod::Modulo),
            "_set" => Some(MetaMethod::Set),
            "_get" => Some(MetaMethod::Get),
            "_typeof" => Some(MetaMethod::TypeOf),
            "_nexti" => Some(MetaMethod::NextI),
            "_cmp" => Some(MetaMethod::Cmp),
            "_call" => Some(MetaMethod::Call),
            "_cloned" => Some(MetaMethod::Cloned),
            "_newslot" => Some(MetaMethod::NewSlot),
            "_delslot" => Some(MetaMethod::DelSlot),
            "_tostring" => Some(MetaMethod::ToString),
            "_newmember" => Some(MetaMethod::NewMember),
            "_inherited" => Some(MetaMethod::Inherited),
            _ => None,
        }
    }

    pub fn iter() -> impl Iterator<Item = MetaMethod> {
        (0..MM_COUNT as u8).filter_map(MetaMethod::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        for mm in MetaMethod::iter() {
            assert_eq!(MetaMethod::from_name(mm.name()), Some(mm));
            assert_eq!(MetaMethod::from_u8(mm as u8), Some(mm));
        }
        assert_eq!(MetaMethod::from_name("_frobnicate"), None);
        assert_eq!(MetaMethod::from_u8(MM_COUNT as u8), None);
    }
}
