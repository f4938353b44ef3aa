//! Generated runtime support functions.
//!
//! Strings and boxed dynamic values have no native operations in the
//! target format, so the builders here emit them from scratch as
//! ordinary module-local functions over the shared heap types. The
//! index block sits directly after the host imports, before any user
//! function.

pub mod any;
pub mod strings;

pub use any::{
    emit_any_truthy, emit_any_typeof, emit_box_boolean, emit_box_number, emit_box_ref,
    emit_unbox_boolean, emit_unbox_number, emit_unbox_ref, TYPEOF_TAGS,
};
pub use strings::{
    emit_string_char_at, emit_string_concat, emit_string_eq, emit_string_len, emit_string_slice,
};

/// Runtime type tags carried in the boxed any struct.
pub const TAG_UNDEFINED: i32 = 0;
pub const TAG_NULL: i32 = 1;
pub const TAG_BOOLEAN: i32 = 2;
pub const TAG_NUMBER: i32 = 3;
pub const TAG_STRING: i32 = 4;
pub const TAG_OBJECT: i32 = 5;
pub const TAG_ARRAY: i32 = 6;
pub const TAG_FUNCTION: i32 = 7;
pub const TAG_EXTREF: i32 = 8;

/// Indices of the generated runtime functions.
///
/// These are local functions in the output module; their bodies are
/// produced by the `emit_*` builders in declaration order.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFunctions {
    pub string_len: u32,
    pub string_concat: u32,
    pub string_eq: u32,
    pub string_slice: u32,
    pub string_char_at: u32,
    pub box_number: u32,
    pub box_boolean: u32,
    pub box_ref: u32,
    pub unbox_number: u32,
    pub unbox_boolean: u32,
    pub unbox_ref: u32,
    pub any_typeof: u32,
    pub any_truthy: u32,
    /// Total count of runtime functions.
    pub count: u32,
}

impl RuntimeFunctions {
    /// Assign runtime function indices starting at `base`.
    pub fn new(base: u32) -> Self {
        let mut idx = base;
        let mut next = || {
            let i = idx;
            idx += 1;
            i
        };
        let string_len = next();
        let string_concat = next();
        let string_eq = next();
        let string_slice = next();
        let string_char_at = next();
        let box_number = next();
        let box_boolean = next();
        let box_ref = next();
        let unbox_number = next();
        let unbox_boolean = next();
        let unbox_ref = next();
        let any_typeof = next();
        let any_truthy = next();
        Self {
            string_len,
            string_concat,
            string_eq,
            string_slice,
            string_char_at,
            box_number,
            box_boolean,
            box_ref,
            unbox_number,
            unbox_boolean,
            unbox_ref,
            any_typeof,
            any_truthy,
            count: idx - base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_contiguous_from_base() {
        let rt = RuntimeFunctions::new(3);
        assert_eq!(rt.string_len, 3);
        assert_eq!(rt.any_truthy, 3 + rt.count - 1);
        assert_eq!(rt.count, 13);
    }
}
