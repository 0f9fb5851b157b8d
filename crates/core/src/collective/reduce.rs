//! Element-wise sum kernels used by the all-reduce collectives.
//!
//! The accumulator is updated in place. Dispatch is by the pipe's float
//! type: `F32` and the block-quantized types are summed as 32-bit floats
//! (quantized pipes carry dequantized partials during reduction), `F16`
//! converts through f32. Trailing bytes not covered by a whole element fall
//! back to wrapping byte addition; well-formed pipes never have any.

use half::f16;

use crate::config::FloatType;

/// `acc[i] += input[i]` over `acc.len()` bytes, interpreted per `float_type`.
///
/// # Panics
/// Panics if the slices differ in length.
pub fn reduce_sum(acc: &mut [u8], input: &[u8], float_type: FloatType) {
    assert_eq!(acc.len(), input.len(), "reduce operands must match");
    if acc.is_empty() {
        return;
    }
    match float_type {
        FloatType::F32 | FloatType::Q80 | FloatType::Q40 => reduce_sum_f32(acc, input),
        FloatType::F16 => reduce_sum_f16(acc, input),
    }
}

fn reduce_sum_f32(acc: &mut [u8], input: &[u8]) {
    let mut acc_chunks = acc.chunks_exact_mut(4);
    let mut input_chunks = input.chunks_exact(4);
    for (a, b) in acc_chunks.by_ref().zip(input_chunks.by_ref()) {
        let sum = f32::from_ne_bytes(a.try_into().unwrap()) + f32::from_ne_bytes(b.try_into().unwrap());
        a.copy_from_slice(&sum.to_ne_bytes());
    }
    reduce_sum_bytes(acc_chunks.into_remainder(), input_chunks.remainder());
}

fn reduce_sum_f16(acc: &mut [u8], input: &[u8]) {
    let mut acc_chunks = acc.chunks_exact_mut(2);
    let mut input_chunks = input.chunks_exact(2);
    for (a, b) in acc_chunks.by_ref().zip(input_chunks.by_ref()) {
        let lhs = f16::from_bits(u16::from_ne_bytes(a.try_into().unwrap())).to_f32();
        let rhs = f16::from_bits(u16::from_ne_bytes(b.try_into().unwrap())).to_f32();
        let sum = f16::from_f32(lhs + rhs);
        a.copy_from_slice(&sum.to_bits().to_ne_bytes());
    }
    reduce_sum_bytes(acc_chunks.into_remainder(), input_chunks.remainder());
}

fn reduce_sum_bytes(acc: &mut [u8], input: &[u8]) {
    for (a, b) in acc.iter_mut().zip(input) {
        *a = a.wrapping_add(*b);
    }
}
