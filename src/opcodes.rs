//! Byte-level emitters for the small System V AMD64 instruction vocabulary
//! the code generator needs: SSE2 scalar-double moves and arithmetic against
//! `rdi`- (input vector), `rbx`- (scratch RAM), and `rsi`-relative slots, and
//! calls through the `rdx` helper-pointer array.
//!
//! All memory operands use an explicit 32-bit displacement; slot numbers are
//! byte-scaled here.

use crate::expression::BinaryOp;

fn emit_disp32(code: &mut Vec<u8>, slot: usize) {
    let disp = (slot * 8) as u32;
    code.extend_from_slice(&disp.to_le_bytes());
}

pub(crate) fn push_rbx(code: &mut Vec<u8>) {
    code.push(0x53);
}

pub(crate) fn pop_rbx(code: &mut Vec<u8>) {
    code.push(0x5B);
}

pub(crate) fn push_rdi(code: &mut Vec<u8>) {
    code.push(0x57);
}

pub(crate) fn pop_rdi(code: &mut Vec<u8>) {
    code.push(0x5F);
}

pub(crate) fn push_rdx(code: &mut Vec<u8>) {
    code.push(0x52);
}

pub(crate) fn pop_rdx(code: &mut Vec<u8>) {
    code.push(0x5A);
}

/// `mov rbx, rsi` — the scratch base moves to a callee-saved register so it
/// survives the helper calls.
pub(crate) fn mov_rsi_to_rbx(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0x48, 0x89, 0xF3]);
}

pub(crate) fn ret(code: &mut Vec<u8>) {
    code.push(0xC3);
}

/// `movsd xmm0, [rdi + 8*slot]`
pub(crate) fn load_from_rdi_offset_to_xmm0(code: &mut Vec<u8>, slot: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x87]);
    emit_disp32(code, slot);
}

/// `movsd xmm0, [rbx + 8*slot]`
pub(crate) fn load_from_rbx_offset_to_xmm0(code: &mut Vec<u8>, slot: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x83]);
    emit_disp32(code, slot);
}

/// `movsd xmm0, [rsi + 8*slot]`
pub(crate) fn load_from_rsi_offset_to_xmm0(code: &mut Vec<u8>, slot: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x86]);
    emit_disp32(code, slot);
}

/// `movsd [rbx + 8*slot], xmm0`
pub(crate) fn store_xmm0_to_rbx_offset(code: &mut Vec<u8>, slot: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x11, 0x83]);
    emit_disp32(code, slot);
}

/// `mov rax, imm64; movq xmm0, rax` — rax is fair game, nothing lives there.
pub(crate) fn load_immediate_to_xmm0(code: &mut Vec<u8>, value: f64) {
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&value.to_bits().to_le_bytes());
    code.extend_from_slice(&[0x66, 0x48, 0x0F, 0x6E, 0xC0]);
}

/// `mov rax, imm64; movq xmm1, rax`
pub(crate) fn load_immediate_to_xmm1(code: &mut Vec<u8>, value: f64) {
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&value.to_bits().to_le_bytes());
    code.extend_from_slice(&[0x66, 0x48, 0x0F, 0x6E, 0xC8]);
}

impl BinaryOp {
    // addsd / subsd / mulsd / divsd share their encoding up to this opcode.
    fn sse_opcode(self) -> u8 {
        match self {
            BinaryOp::Add => 0x58,
            BinaryOp::Sub => 0x5C,
            BinaryOp::Mul => 0x59,
            BinaryOp::Div => 0x5E,
        }
    }
}

/// `{add,sub,mul,div}sd xmm0, [rbx + 8*slot]`
pub(crate) fn op_from_rbx_offset_to_xmm0(code: &mut Vec<u8>, op: BinaryOp, slot: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, op.sse_opcode(), 0x83]);
    emit_disp32(code, slot);
}

/// `{add,sub,mul,div}sd xmm0, [rdi + 8*slot]`
pub(crate) fn op_from_rdi_offset_to_xmm0(code: &mut Vec<u8>, op: BinaryOp, slot: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, op.sse_opcode(), 0x87]);
    emit_disp32(code, slot);
}

/// `{add,sub,mul,div}sd xmm0, xmm1`
pub(crate) fn op_xmm1_to_xmm0(code: &mut Vec<u8>, op: BinaryOp) {
    code.extend_from_slice(&[0xF2, 0x0F, op.sse_opcode(), 0xC1]);
}

/// `call qword ptr [rdx + 8*index]` — the runtime math helpers.
pub(crate) fn call_function_from_rdx_array(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xFF, 0x92]);
    emit_disp32(code, index);
}
