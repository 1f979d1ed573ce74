//! Machine-code assembly of remote call stubs.
//!
//! A stub is a tiny position-independent routine that loads the call arguments,
//! invokes the target routine, optionally stores its return register to a capture
//! address, zeroes the return register, and returns. It runs as the entry point of
//! a single foreign thread, so the thread's own exit code carries no information;
//! the capture address does.

use crate::arch::Architecture;

/// The calling convention a stub invokes its target with.
///
/// Only meaningful on x86; the x64 convention is fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallingConvention {
    /// Arguments pushed right to left, callee cleans the stack.
    StdCall,
    /// First two arguments in `ecx` and `edx`, rest pushed right to left.
    FastCall,
}

/// One routine invocation to assemble a stub for.
#[derive(Debug)]
pub(crate) struct CallDescriptor<'a> {
    /// Address of the routine in the foreign process.
    pub address: u64,
    /// Calling convention (x86 only).
    pub convention: CallingConvention,
    /// Arguments, left to right.
    pub arguments: &'a [u64],
    /// Address in the foreign process to store the return register to, if the
    /// caller wants the result.
    pub return_address: Option<u64>,
}

/// Assembles the stub bytes for one call on the given architecture.
pub(crate) fn assemble(architecture: Architecture, call: &CallDescriptor) -> Vec<u8> {
    match architecture {
        Architecture::X86 => assemble_x86(call),
        Architecture::X64 => assemble_x64(call),
    }
}

fn assemble_x64(call: &CallDescriptor) -> Vec<u8> {
    let mut stub = Vec::new();

    // Home space for the four register arguments plus alignment, and one slot for
    // every stack argument.
    let stack_argument_count = call.arguments.len().saturating_sub(4);
    let shadow_space = 0x28 + 8 * stack_argument_count as u8;

    // sub rsp, shadow_space
    stub.extend_from_slice(&[0x48, 0x83, 0xEC, shadow_space]);

    const ZERO_IDIOMS: [&[u8]; 4] = [
        &[0x31, 0xC9],       // xor ecx, ecx
        &[0x31, 0xD2],       // xor edx, edx
        &[0x4D, 0x31, 0xC0], // xor r8, r8
        &[0x4D, 0x31, 0xC9], // xor r9, r9
    ];
    const MOV_R32: [&[u8]; 4] = [
        &[0xB9],       // mov ecx, imm32
        &[0xBA],       // mov edx, imm32
        &[0x41, 0xB8], // mov r8d, imm32
        &[0x41, 0xB9], // mov r9d, imm32
    ];
    const MOV_R64: [&[u8]; 4] = [
        &[0x48, 0xB9], // mov rcx, imm64
        &[0x48, 0xBA], // mov rdx, imm64
        &[0x49, 0xB8], // mov r8, imm64
        &[0x49, 0xB9], // mov r9, imm64
    ];

    for (index, &argument) in call.arguments.iter().take(4).enumerate() {
        if argument == 0 {
            stub.extend_from_slice(ZERO_IDIOMS[index]);
        } else if argument <= u64::from(u32::MAX) {
            stub.extend_from_slice(MOV_R32[index]);
            stub.extend_from_slice(&(argument as u32).to_le_bytes());
        } else {
            stub.extend_from_slice(MOV_R64[index]);
            stub.extend_from_slice(&argument.to_le_bytes());
        }
    }

    for &argument in call.arguments.iter().skip(4).rev() {
        push_argument_x64(&mut stub, argument);
    }

    // mov rax, address; call rax
    stub.push(0x48);
    stub.push(0xB8);
    stub.extend_from_slice(&call.address.to_le_bytes());
    stub.extend_from_slice(&[0xFF, 0xD0]);

    if let Some(return_address) = call.return_address {
        // mov [return_address], rax
        stub.extend_from_slice(&[0x48, 0xA3]);
        stub.extend_from_slice(&return_address.to_le_bytes());
    }

    // xor eax, eax
    stub.extend_from_slice(&[0x31, 0xC0]);

    // add rsp, shadow_space
    stub.extend_from_slice(&[0x48, 0x83, 0xC4, shadow_space]);

    stub.push(0xC3);
    stub
}

fn push_argument_x64(stub: &mut Vec<u8>, argument: u64) {
    if argument <= i8::MAX as u64 {
        stub.extend_from_slice(&[0x6A, argument as u8]);
    } else if argument <= i32::MAX as u64 {
        // push imm32 sign-extends, so only non-negative i32 values qualify.
        stub.push(0x68);
        stub.extend_from_slice(&(argument as u32).to_le_bytes());
    } else {
        // mov rax, imm64; push rax
        stub.extend_from_slice(&[0x48, 0xB8]);
        stub.extend_from_slice(&argument.to_le_bytes());
        stub.push(0x50);
    }
}

fn assemble_x86(call: &CallDescriptor) -> Vec<u8> {
    let mut stub = Vec::new();

    let stack_arguments = match call.convention {
        CallingConvention::StdCall => call.arguments,
        CallingConvention::FastCall => {
            for (index, &argument) in call.arguments.iter().take(2).enumerate() {
                if argument == 0 {
                    // xor ecx, ecx / xor edx, edx
                    stub.extend_from_slice(if index == 0 { &[0x31, 0xC9] } else { &[0x31, 0xD2] });
                } else {
                    // mov ecx, imm32 / mov edx, imm32
                    stub.push(if index == 0 { 0xB9 } else { 0xBA });
                    stub.extend_from_slice(&(argument as u32).to_le_bytes());
                }
            }

            call.arguments.get(2..).unwrap_or(&[])
        }
    };

    for &argument in stack_arguments.iter().rev() {
        if argument <= i8::MAX as u64 {
            stub.extend_from_slice(&[0x6A, argument as u8]);
        } else {
            stub.push(0x68);
            stub.extend_from_slice(&(argument as u32).to_le_bytes());
        }
    }

    // mov eax, address; call eax
    stub.push(0xB8);
    stub.extend_from_slice(&(call.address as u32).to_le_bytes());
    stub.extend_from_slice(&[0xFF, 0xD0]);

    if let Some(return_address) = call.return_address {
        // mov [return_address], eax
        stub.push(0xA3);
        stub.extend_from_slice(&(return_address as u32).to_le_bytes());
    }

    // xor eax, eax
    stub.extend_from_slice(&[0x31, 0xC0]);

    stub.push(0xC3);
    stub
}
