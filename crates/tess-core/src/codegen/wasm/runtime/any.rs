//! Boxed dynamic-value helpers.
//!
//! The boxed representation is a three-field struct: runtime tag,
//! numeric payload, reference payload. Unboxing with the wrong tag
//! reports through the host's type-error import and then traps; it
//! never reinterprets the payload.

use wasm_encoder::{AbstractHeapType, BlockType, Function, HeapType, Instruction, ValType};

use super::{
    TAG_ARRAY, TAG_BOOLEAN, TAG_EXTREF, TAG_FUNCTION, TAG_NULL, TAG_NUMBER, TAG_OBJECT,
    TAG_STRING, TAG_UNDEFINED,
};

/// `typeof` tag names, checked in this order by the generated query
/// function.
pub const TYPEOF_TAGS: &[(i32, &str)] = &[
    (TAG_NUMBER, "number"),
    (TAG_STRING, "string"),
    (TAG_BOOLEAN, "boolean"),
    (TAG_FUNCTION, "function"),
    (TAG_UNDEFINED, "undefined"),
    (TAG_NULL, "object"),
    (TAG_OBJECT, "object"),
    (TAG_ARRAY, "object"),
    (TAG_EXTREF, "object"),
];

const NULL_ANY: Instruction<'static> = Instruction::RefNull(HeapType::Abstract {
    shared: false,
    ty: AbstractHeapType::Any,
});

/// box_number: (f64) -> any
pub fn emit_box_number(any_idx: u32) -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::I32Const(TAG_NUMBER));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&NULL_ANY);
    f.instruction(&Instruction::StructNew(any_idx));
    f.instruction(&Instruction::End);
    f
}

/// box_boolean: (i32) -> any
pub fn emit_box_boolean(any_idx: u32) -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::I32Const(TAG_BOOLEAN));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::F64ConvertI32U);
    f.instruction(&NULL_ANY);
    f.instruction(&Instruction::StructNew(any_idx));
    f.instruction(&Instruction::End);
    f
}

/// box_ref: (anyref, i32 tag) -> any
pub fn emit_box_ref(any_idx: u32) -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::F64Const(0.0));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructNew(any_idx));
    f.instruction(&Instruction::End);
    f
}

fn emit_tag_check(f: &mut Function, any_idx: u32, expected_tag_local_or_const: TagSource, throw_idx: u32) {
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 0,
    });
    match expected_tag_local_or_const {
        TagSource::Const(t) => {
            f.instruction(&Instruction::I32Const(t));
        }
        TagSource::Local(l) => {
            f.instruction(&Instruction::LocalGet(l));
        }
    }
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::If(BlockType::Empty));
    match expected_tag_local_or_const {
        TagSource::Const(t) => {
            f.instruction(&Instruction::I32Const(t));
        }
        TagSource::Local(l) => {
            f.instruction(&Instruction::LocalGet(l));
        }
    }
    f.instruction(&Instruction::Call(throw_idx));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
}

enum TagSource {
    Const(i32),
    Local(u32),
}

/// unbox_number: (any) -> f64; wrong tag reports and traps
pub fn emit_unbox_number(any_idx: u32, throw_idx: u32) -> Function {
    let mut f = Function::new([]);
    emit_tag_check(&mut f, any_idx, TagSource::Const(TAG_NUMBER), throw_idx);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 1,
    });
    f.instruction(&Instruction::End);
    f
}

/// unbox_boolean: (any) -> i32
pub fn emit_unbox_boolean(any_idx: u32, throw_idx: u32) -> Function {
    let mut f = Function::new([]);
    emit_tag_check(&mut f, any_idx, TagSource::Const(TAG_BOOLEAN), throw_idx);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 1,
    });
    f.instruction(&Instruction::F64Const(0.0));
    f.instruction(&Instruction::F64Ne);
    f.instruction(&Instruction::End);
    f
}

/// unbox_ref: (any, i32 expected tag) -> anyref
pub fn emit_unbox_ref(any_idx: u32, throw_idx: u32) -> Function {
    let mut f = Function::new([]);
    emit_tag_check(&mut f, any_idx, TagSource::Local(1), throw_idx);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 2,
    });
    f.instruction(&Instruction::End);
    f
}

/// typeof: (any) -> string
///
/// `tag_names` pairs each runtime tag with the interned (offset, len)
/// of its tag-name literal, in `TYPEOF_TAGS` order.
pub fn emit_any_typeof(any_idx: u32, string_idx: u32, tag_names: &[(i32, u32, u32)]) -> Function {
    let mut f = Function::new([]);
    for &(tag, off, len) in tag_names {
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::StructGet {
            struct_type_index: any_idx,
            field_index: 0,
        });
        f.instruction(&Instruction::I32Const(tag));
        f.instruction(&Instruction::I32Eq);
        f.instruction(&Instruction::If(BlockType::Empty));
        f.instruction(&Instruction::I32Const(off as i32));
        f.instruction(&Instruction::I32Const(len as i32));
        f.instruction(&Instruction::ArrayNewData {
            array_type_index: string_idx,
            array_data_index: 0,
        });
        f.instruction(&Instruction::Return);
        f.instruction(&Instruction::End);
    }
    // Unknown tags cannot arise from generated boxing code.
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
    f
}

/// truthy: (any) -> i32, with source-language truthiness rules.
pub fn emit_any_truthy(any_idx: u32, string_idx: u32) -> Function {
    // local: 1 = tag
    let mut f = Function::new([(1, ValType::I32)]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 0,
    });
    f.instruction(&Instruction::LocalSet(1));

    // undefined / null
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Const(TAG_UNDEFINED));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Const(TAG_NULL));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::I32Or);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);

    // boolean: payload non-zero
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Const(TAG_BOOLEAN));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 1,
    });
    f.instruction(&Instruction::F64Const(0.0));
    f.instruction(&Instruction::F64Ne);
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);

    // number: non-NaN and non-zero
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Const(TAG_NUMBER));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 1,
    });
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 1,
    });
    f.instruction(&Instruction::F64Eq);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 1,
    });
    f.instruction(&Instruction::F64Const(0.0));
    f.instruction(&Instruction::F64Ne);
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);

    // string: non-empty
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Const(TAG_STRING));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: any_idx,
        field_index: 2,
    });
    f.instruction(&Instruction::RefCastNonNull(HeapType::Concrete(string_idx)));
    f.instruction(&Instruction::ArrayLen);
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);

    // objects, arrays, functions, external references
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::End);
    f
}
