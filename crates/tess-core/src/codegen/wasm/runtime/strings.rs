//! Generated string operations over the `array (mut i8)` heap type.
//!
//! Out-of-range indices are deliberately not validated here; callers
//! are expected to have produced in-range values, and the target's
//! own bounds traps catch the rest.

use wasm_encoder::{BlockType, Function, HeapType, Instruction, RefType, ValType};

/// length: (string) -> f64
pub fn emit_string_len(_string_idx: u32) -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::ArrayLen);
    f.instruction(&Instruction::F64ConvertI32U);
    f.instruction(&Instruction::End);
    f
}

/// concat: (string, string) -> string
///
/// Allocates a backing array sized to the sum of lengths and performs
/// two bounded copies.
pub fn emit_string_concat(string_idx: u32) -> Function {
    // locals: 2 = len_a, 3 = len_b, 4 = out
    let mut f = Function::new([
        (2, ValType::I32),
        (
            1,
            ValType::Ref(RefType {
                nullable: true,
                heap_type: HeapType::Concrete(string_idx),
            }),
        ),
    ]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::ArrayLen);
    f.instruction(&Instruction::LocalSet(2));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::ArrayLen);
    f.instruction(&Instruction::LocalSet(3));

    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::ArrayNewDefault(string_idx));
    f.instruction(&Instruction::LocalSet(4));

    // out[0..len_a] = a
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::ArrayCopy {
        array_type_index_dst: string_idx,
        array_type_index_src: string_idx,
    });

    // out[len_a..] = b
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::ArrayCopy {
        array_type_index_dst: string_idx,
        array_type_index_src: string_idx,
    });

    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::End);
    f
}

/// eq: (string, string) -> i32
pub fn emit_string_eq(string_idx: u32) -> Function {
    // locals: 2 = i, 3 = len
    let mut f = Function::new([(2, ValType::I32)]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::ArrayLen);
    f.instruction(&Instruction::LocalSet(3));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::ArrayLen);
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);

    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::Loop(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32GeU);
    f.instruction(&Instruction::BrIf(1));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::ArrayGetU(string_idx));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::ArrayGetU(string_idx));
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalSet(2));
    f.instruction(&Instruction::Br(0));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);

    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::End);
    f
}

/// slice: (string, f64 start, f64 end) -> string
pub fn emit_string_slice(string_idx: u32) -> Function {
    // locals: 3 = start, 4 = len, 5 = out
    let mut f = Function::new([
        (2, ValType::I32),
        (
            1,
            ValType::Ref(RefType {
                nullable: true,
                heap_type: HeapType::Concrete(string_idx),
            }),
        ),
    ]);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32TruncF64S);
    f.instruction(&Instruction::LocalSet(3));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32TruncF64S);
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::LocalSet(4));

    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::ArrayNewDefault(string_idx));
    f.instruction(&Instruction::LocalSet(5));

    f.instruction(&Instruction::LocalGet(5));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::ArrayCopy {
        array_type_index_dst: string_idx,
        array_type_index_src: string_idx,
    });

    f.instruction(&Instruction::LocalGet(5));
    f.instruction(&Instruction::End);
    f
}

/// charAt: (string, f64) -> string
pub fn emit_string_char_at(string_idx: u32) -> Function {
    // local: 2 = out
    let mut f = Function::new([(
        1,
        ValType::Ref(RefType {
            nullable: true,
            heap_type: HeapType::Concrete(string_idx),
        }),
    )]);
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::ArrayNewDefault(string_idx));
    f.instruction(&Instruction::LocalSet(2));

    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32TruncF64S);
    f.instruction(&Instruction::ArrayGetU(string_idx));
    f.instruction(&Instruction::ArraySet(string_idx));

    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::End);
    f
}
