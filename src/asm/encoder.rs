//! Lowering of parsed statements onto iced-x86's `CodeAssembler`

use std::collections::HashMap;

use iced_x86::code_asm::{
    byte_ptr, dword_ptr, ptr, qword_ptr, word_ptr, xmmword_ptr, AsmMemoryOperand, AsmRegister16,
    AsmRegister32, AsmRegister64, AsmRegister8, AsmRegisterXmm, CodeAssembler, CodeLabel,
};
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, BlockEncoderResult, Encoder, Instruction, InstructionBlock,
    OpKind, Register,
};

use super::error::{AsmError, AsmResult};
use super::parser::{MemorySize, MemoryTerm, Operand, Statement, StatementKind};

mod regs {
    use iced_x86::code_asm::*;

    macro_rules! register_lookup {
        ($name:ident -> $ty:ty { $($reg:ident),* $(,)? }) => {
            pub(super) fn $name(name: &str) -> Option<$ty> {
                match name {
                    $(stringify!($reg) => Some($reg),)*
                    _ => None,
                }
            }
        };
    }

    register_lookup!(gpr8 -> AsmRegister8 {
        al, cl, dl, bl, ah, ch, dh, bh, spl, bpl, sil, dil,
        r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
    });
    register_lookup!(gpr16 -> AsmRegister16 {
        ax, cx, dx, bx, sp, bp, si, di,
        r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
    });
    register_lookup!(gpr32 -> AsmRegister32 {
        eax, ecx, edx, ebx, esp, ebp, esi, edi,
        r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
    });
    register_lookup!(gpr64 -> AsmRegister64 {
        rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
        r8, r9, r10, r11, r12, r13, r14, r15,
    });
    register_lookup!(xmm -> AsmRegisterXmm {
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
        xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
    });
}

/// Resolved operand
enum Op {
    R8(AsmRegister8),
    R16(AsmRegister16),
    R32(AsmRegister32),
    R64(AsmRegister64),
    Xmm(AsmRegisterXmm),
    Mem(AsmMemoryOperand),
    Imm(i64),
    Label(CodeLabel),
}

/// Integer forms shared by add/sub/and/or/xor/cmp/adc/sbb
macro_rules! alu_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R8(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::R16(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::R32(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::R64(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R32(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R64(s)] => $a.$m(*d, *s),
            [Op::R8(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R16(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R8(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::R16(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::R32(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::R64(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::Mem(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            _ => return Err($bad),
        }
    };
}

/// Shift and rotate forms; a register count must be `cl`
macro_rules! shift_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R8(d), Op::R8(c)] => $a.$m(*d, *c),
            [Op::R16(d), Op::R8(c)] => $a.$m(*d, *c),
            [Op::R32(d), Op::R8(c)] => $a.$m(*d, *c),
            [Op::R64(d), Op::R8(c)] => $a.$m(*d, *c),
            [Op::Mem(d), Op::R8(c)] => $a.$m(*d, *c),
            [Op::R8(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::R16(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::R32(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::R64(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            [Op::Mem(d), Op::Imm(v)] => $a.$m(*d, imm32(*v)?),
            _ => return Err($bad),
        }
    };
}

/// Single register-or-memory operand
macro_rules! unary_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R8(d)] => $a.$m(*d),
            [Op::R16(d)] => $a.$m(*d),
            [Op::R32(d)] => $a.$m(*d),
            [Op::R64(d)] => $a.$m(*d),
            [Op::Mem(d)] => $a.$m(*d),
            _ => return Err($bad),
        }
    };
}

/// Conditional branches take a label or an absolute target
macro_rules! jcc_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::Label(l)] => $a.$m(*l),
            [Op::Imm(v)] => $a.$m(*v as u64),
            _ => return Err($bad),
        }
    };
}

/// Scalar and packed SSE arithmetic: xmm destination, xmm or memory source
macro_rules! sse_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::Xmm(d), Op::Xmm(s)] => $a.$m(*d, *s),
            [Op::Xmm(d), Op::Mem(s)] => $a.$m(*d, *s),
            _ => return Err($bad),
        }
    };
}

/// SSE moves, which can also store to memory
macro_rules! sse_move_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::Xmm(d), Op::Xmm(s)] => $a.$m(*d, *s),
            [Op::Xmm(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::Xmm(s)] => $a.$m(*d, *s),
            _ => return Err($bad),
        }
    };
}

/// Movzx/movsx
macro_rules! extend_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R16(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::R16(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::Mem(s)] => $a.$m(*d, *s),
            _ => return Err($bad),
        }
    };
}

/// Xchg/xadd/cmpxchg: register or memory destination, register source
macro_rules! exchange_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R8(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::R16(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::R32(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::R64(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R8(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R32(s)] => $a.$m(*d, *s),
            [Op::Mem(d), Op::R64(s)] => $a.$m(*d, *s),
            _ => return Err($bad),
        }
    };
}

/// Setcc writes one byte
macro_rules! setcc_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R8(d)] => $a.$m(*d),
            [Op::Mem(d)] => $a.$m(*d),
            _ => return Err($bad),
        }
    };
}

/// Cmovcc has no 8-bit or immediate forms
macro_rules! cmov_forms {
    ($a:expr, $m:ident, $ops:expr, $bad:expr) => {
        match $ops {
            [Op::R16(d), Op::R16(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::R32(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::R64(s)] => $a.$m(*d, *s),
            [Op::R16(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R32(d), Op::Mem(s)] => $a.$m(*d, *s),
            [Op::R64(d), Op::Mem(s)] => $a.$m(*d, *s),
            _ => return Err($bad),
        }
    };
}

/// Base or index register, sized by the address width of the code
#[derive(Debug, Clone, Copy)]
enum AddressRegister {
    R16(AsmRegister16),
    R32(AsmRegister32),
    R64(AsmRegister64),
}

impl AddressRegister {
    fn lookup(name: &str, bitness: u32) -> Option<Self> {
        match bitness {
            16 => regs::gpr16(name).map(Self::R16),
            32 => regs::gpr32(name).map(Self::R32),
            _ => regs::gpr64(name).map(Self::R64),
        }
    }

    fn base(self) -> AsmMemoryOperand {
        match self {
            Self::R16(r) => AsmMemoryOperand::from(r),
            Self::R32(r) => AsmMemoryOperand::from(r),
            Self::R64(r) => AsmMemoryOperand::from(r),
        }
    }

    /// 16-bit addressing has no scaled index and needs a base
    fn index(self, base: Option<Self>, scale: u32) -> AsmResult<AsmMemoryOperand> {
        let scaled = match (self, base) {
            (Self::R32(r), _) => r * scale,
            (Self::R64(r), _) => r * scale,
            (Self::R16(i), Some(Self::R16(b))) if scale == 1 => return Ok(b + i),
            (Self::R16(_), _) => {
                return Err(AsmError::operand(
                    "16-bit addressing needs a base register and an unscaled index",
                ))
            }
        };
        Ok(match base {
            Some(b) => b.base() + scaled,
            None => scaled,
        })
    }
}

/// Instructions that accept a `lock` prefix with a memory destination
fn is_lockable(mnemonic: &str) -> bool {
    matches!(
        mnemonic,
        "add" | "adc" | "and" | "or" | "sbb" | "sub" | "xor" | "inc" | "dec" | "neg" | "not"
            | "xchg" | "xadd" | "cmpxchg"
    )
}

fn disp32(displacement: i64) -> AsmResult<i32> {
    i32::try_from(displacement).map_err(|_| {
        AsmError::operand(format!("displacement 0x{:X} does not fit in 32 bits", displacement))
    })
}

/// Immediate operand as a 32-bit value; unsigned 32-bit bit patterns are accepted
fn imm32(value: i64) -> AsmResult<i32> {
    if let Ok(v) = i32::try_from(value) {
        Ok(v)
    } else if let Ok(v) = u32::try_from(value) {
        Ok(v as i32)
    } else {
        Err(AsmError::operand(format!(
            "immediate 0x{:X} does not fit in 32 bits",
            value
        )))
    }
}

/// Lowers statements for one assembly pass
struct Lowering {
    asm: CodeAssembler,
    labels: HashMap<String, CodeLabel>,
    /// Every defined label name mapped to the first label of its group
    aliases: HashMap<String, String>,
    bitness: u32,
    address: u64,
    /// Displacement of the `[rip + disp]` operand of the instruction being lowered
    rip_displacement: Option<i32>,
    /// Instruction index and disp32 of every `[rip + disp]` operand
    rip_relative: Vec<(usize, i32)>,
}

impl Lowering {
    fn new(bitness: u32, address: u64, statements: &[Statement]) -> AsmResult<Self> {
        let mut asm = CodeAssembler::new(bitness)?;
        asm.set_prefer_short_branch(false);

        Ok(Self {
            asm,
            labels: HashMap::new(),
            aliases: label_aliases(statements)?,
            bitness,
            address,
            rip_displacement: None,
            rip_relative: Vec::new(),
        })
    }

    fn label(&mut self, name: &str) -> Option<CodeLabel> {
        let canonical = self.aliases.get(name)?;
        let asm = &mut self.asm;
        Some(
            *self
                .labels
                .entry(canonical.clone())
                .or_insert_with(|| asm.create_label()),
        )
    }

    fn statement(&mut self, statement: &Statement) -> AsmResult<()> {
        match &statement.kind {
            StatementKind::Label(name) => {
                // Later labels of a group share the first one's position
                if self.aliases.get(name) == Some(name) {
                    let asm = &mut self.asm;
                    let label = self
                        .labels
                        .entry(name.clone())
                        .or_insert_with(|| asm.create_label());
                    self.asm.set_label(label)?;
                }
                Ok(())
            }
            StatementKind::Data(bytes) => Ok(self.asm.db(bytes)?),
            StatementKind::Instruction {
                mnemonic,
                operands,
                short,
                lock,
            } => {
                let index = self.asm.instructions().len();
                self.rip_displacement = None;
                let ops = operands
                    .iter()
                    .map(|o| self.operand(o))
                    .collect::<AsmResult<Vec<Op>>>()?;

                if *lock && !(is_lockable(mnemonic) && matches!(ops.first(), Some(Op::Mem(_)))) {
                    return Err(AsmError::operand(format!(
                        "`lock {}` needs a lockable instruction with a memory destination",
                        mnemonic
                    )));
                }

                self.asm.set_prefer_short_branch(*short);
                let result = self.instruction(mnemonic, &ops, *lock);
                self.asm.set_prefer_short_branch(false);
                result?;

                if let Some(displacement) = self.rip_displacement.take() {
                    self.rip_relative.push((index, displacement));
                }
                Ok(())
            }
        }
    }

    fn operand(&mut self, operand: &Operand) -> AsmResult<Op> {
        match operand {
            Operand::Immediate(v) => Ok(Op::Imm(*v)),
            Operand::Ident(name) => {
                if let Some(r) = regs::gpr64(name) {
                    Ok(Op::R64(r))
                } else if let Some(r) = regs::gpr32(name) {
                    Ok(Op::R32(r))
                } else if let Some(r) = regs::gpr16(name) {
                    Ok(Op::R16(r))
                } else if let Some(r) = regs::gpr8(name) {
                    Ok(Op::R8(r))
                } else if let Some(r) = regs::xmm(name) {
                    Ok(Op::Xmm(r))
                } else if let Some(label) = self.label(name) {
                    Ok(Op::Label(label))
                } else {
                    Err(AsmError::operand(format!("unknown register or label `{}`", name)))
                }
            }
            Operand::Memory { size, terms } => {
                let mem = self.memory(terms)?;
                Ok(Op::Mem(match size {
                    None => ptr(mem),
                    Some(MemorySize::Byte) => byte_ptr(mem),
                    Some(MemorySize::Word) => word_ptr(mem),
                    Some(MemorySize::Dword) => dword_ptr(mem),
                    Some(MemorySize::Qword) => qword_ptr(mem),
                    Some(MemorySize::Xmmword) => xmmword_ptr(mem),
                }))
            }
        }
    }

    fn memory(&mut self, terms: &[MemoryTerm]) -> AsmResult<AsmMemoryOperand> {
        let mut base: Option<AddressRegister> = None;
        let mut index: Option<(AddressRegister, u32)> = None;
        let mut label: Option<CodeLabel> = None;
        let mut rip = false;
        let mut displacement = 0i64;

        for term in terms {
            match term {
                MemoryTerm::Ident(name) if name == "rip" && self.bitness == 64 => {
                    if rip {
                        return Err(AsmError::operand("`rip` used twice in memory operand"));
                    }
                    rip = true;
                }
                MemoryTerm::Ident(name) => {
                    if let Some(reg) = AddressRegister::lookup(name, self.bitness) {
                        if base.is_none() {
                            base = Some(reg);
                        } else if index.is_none() {
                            index = Some((reg, 1));
                        } else {
                            return Err(AsmError::operand("too many registers in memory operand"));
                        }
                    } else if let Some(l) = self.label(name) {
                        if label.replace(l).is_some() {
                            return Err(AsmError::operand("more than one label in memory operand"));
                        }
                    } else {
                        return Err(AsmError::operand(format!(
                            "`{}` is not a {}-bit address register or label",
                            name, self.bitness
                        )));
                    }
                }
                MemoryTerm::Scaled(name, scale) => {
                    let reg = AddressRegister::lookup(name, self.bitness).ok_or_else(|| {
                        AsmError::operand(format!(
                            "`{}` is not a {}-bit address register",
                            name, self.bitness
                        ))
                    })?;
                    if index.replace((reg, *scale)).is_some() {
                        return Err(AsmError::operand("more than one index register"));
                    }
                }
                MemoryTerm::Displacement(v) => displacement = displacement.wrapping_add(*v),
            }
        }

        if rip {
            if base.is_some() || index.is_some() || label.is_some() {
                return Err(AsmError::operand(
                    "`rip` cannot be combined with other registers or a label",
                ));
            }
            // Target is a placeholder inside the block; the disp32 is written after encoding
            self.rip_displacement = Some(disp32(displacement)?);
            return Ok(AsmMemoryOperand::from(Register::RIP) + self.address);
        }

        match (base, index, label) {
            (None, None, Some(label)) if displacement == 0 => Ok(ptr(label)),
            (_, _, Some(_)) => Err(AsmError::operand(
                "a label cannot be combined with registers or a displacement",
            )),
            (Some(b), None, None) => Ok(b.base() + disp32(displacement)?),
            (b, Some((i, scale)), None) => Ok(i.index(b, scale)? + disp32(displacement)?),
            (None, None, None) => self.absolute(displacement),
        }
    }

    /// `[address]` with no registers: disp32, or moffs for `mov` of the accumulator
    fn absolute(&self, address: i64) -> AsmResult<AsmMemoryOperand> {
        if self.bitness < 64 {
            imm32(address).map_err(|_| {
                AsmError::operand(format!(
                    "address 0x{:X} does not fit in {} bits",
                    address, self.bitness
                ))
            })?;
        }
        Ok(AsmMemoryOperand::from(address as u64))
    }

    fn instruction(&mut self, mnemonic: &str, ops: &[Op], lock: bool) -> AsmResult<()> {
        let bad = AsmError::operand(format!(
            "invalid operands for `{}` ({} given)",
            mnemonic,
            ops.len()
        ));
        let a = if lock { self.asm.lock() } else { &mut self.asm };

        let result = match mnemonic {
            "add" => alu_forms!(a, add, ops, bad),
            "sub" => alu_forms!(a, sub, ops, bad),
            "and" => alu_forms!(a, and, ops, bad),
            "or" => alu_forms!(a, or, ops, bad),
            "xor" => alu_forms!(a, xor, ops, bad),
            "cmp" => alu_forms!(a, cmp, ops, bad),
            "adc" => alu_forms!(a, adc, ops, bad),
            "sbb" => alu_forms!(a, sbb, ops, bad),

            "mov" => match ops {
                [Op::R8(d), Op::R8(s)] => a.mov(*d, *s),
                [Op::R16(d), Op::R16(s)] => a.mov(*d, *s),
                [Op::R32(d), Op::R32(s)] => a.mov(*d, *s),
                [Op::R64(d), Op::R64(s)] => a.mov(*d, *s),
                [Op::Mem(d), Op::R8(s)] => a.mov(*d, *s),
                [Op::Mem(d), Op::R16(s)] => a.mov(*d, *s),
                [Op::Mem(d), Op::R32(s)] => a.mov(*d, *s),
                [Op::Mem(d), Op::R64(s)] => a.mov(*d, *s),
                [Op::R8(d), Op::Mem(s)] => a.mov(*d, *s),
                [Op::R16(d), Op::Mem(s)] => a.mov(*d, *s),
                [Op::R32(d), Op::Mem(s)] => a.mov(*d, *s),
                [Op::R64(d), Op::Mem(s)] => a.mov(*d, *s),
                [Op::R8(d), Op::Imm(v)] => a.mov(*d, imm32(*v)?),
                [Op::R16(d), Op::Imm(v)] => a.mov(*d, imm32(*v)?),
                [Op::R32(d), Op::Imm(v)] => a.mov(*d, imm32(*v)?),
                [Op::R64(d), Op::Imm(v)] => a.mov(*d, *v),
                [Op::Mem(d), Op::Imm(v)] => a.mov(*d, imm32(*v)?),
                _ => return Err(bad),
            },

            "test" => match ops {
                [Op::R8(d), Op::R8(s)] => a.test(*d, *s),
                [Op::R16(d), Op::R16(s)] => a.test(*d, *s),
                [Op::R32(d), Op::R32(s)] => a.test(*d, *s),
                [Op::R64(d), Op::R64(s)] => a.test(*d, *s),
                [Op::Mem(d), Op::R8(s)] => a.test(*d, *s),
                [Op::Mem(d), Op::R16(s)] => a.test(*d, *s),
                [Op::Mem(d), Op::R32(s)] => a.test(*d, *s),
                [Op::Mem(d), Op::R64(s)] => a.test(*d, *s),
                [Op::R8(d), Op::Imm(v)] => a.test(*d, imm32(*v)?),
                [Op::R16(d), Op::Imm(v)] => a.test(*d, imm32(*v)?),
                [Op::R32(d), Op::Imm(v)] => a.test(*d, imm32(*v)?),
                [Op::R64(d), Op::Imm(v)] => a.test(*d, imm32(*v)?),
                [Op::Mem(d), Op::Imm(v)] => a.test(*d, imm32(*v)?),
                _ => return Err(bad),
            },

            "xchg" => exchange_forms!(a, xchg, ops, bad),
            "xadd" => exchange_forms!(a, xadd, ops, bad),
            "cmpxchg" => exchange_forms!(a, cmpxchg, ops, bad),

            "lea" => match ops {
                [Op::R16(d), Op::Mem(s)] => a.lea(*d, *s),
                [Op::R32(d), Op::Mem(s)] => a.lea(*d, *s),
                [Op::R64(d), Op::Mem(s)] => a.lea(*d, *s),
                _ => return Err(bad),
            },

            "imul" => match ops {
                [Op::R32(d), Op::R32(s)] => a.imul_2(*d, *s),
                [Op::R64(d), Op::R64(s)] => a.imul_2(*d, *s),
                [Op::R32(d), Op::Mem(s)] => a.imul_2(*d, *s),
                [Op::R64(d), Op::Mem(s)] => a.imul_2(*d, *s),
                [Op::R32(d), Op::R32(s), Op::Imm(v)] => a.imul_3(*d, *s, imm32(*v)?),
                [Op::R64(d), Op::R64(s), Op::Imm(v)] => a.imul_3(*d, *s, imm32(*v)?),
                [Op::R32(d), Op::Mem(s), Op::Imm(v)] => a.imul_3(*d, *s, imm32(*v)?),
                [Op::R64(d), Op::Mem(s), Op::Imm(v)] => a.imul_3(*d, *s, imm32(*v)?),
                _ => return Err(bad),
            },

            "movzx" => extend_forms!(a, movzx, ops, bad),
            "movsx" => extend_forms!(a, movsx, ops, bad),

            "shl" | "sal" => shift_forms!(a, shl, ops, bad),
            "shr" => shift_forms!(a, shr, ops, bad),
            "sar" => shift_forms!(a, sar, ops, bad),
            "rol" => shift_forms!(a, rol, ops, bad),
            "ror" => shift_forms!(a, ror, ops, bad),

            "inc" => unary_forms!(a, inc, ops, bad),
            "dec" => unary_forms!(a, dec, ops, bad),
            "neg" => unary_forms!(a, neg, ops, bad),
            "not" => unary_forms!(a, not, ops, bad),

            "push" => match ops {
                [Op::R16(r)] => a.push(*r),
                [Op::R32(r)] => a.push(*r),
                [Op::R64(r)] => a.push(*r),
                [Op::Mem(m)] => a.push(*m),
                [Op::Imm(v)] => a.push(imm32(*v)?),
                _ => return Err(bad),
            },
            "pop" => match ops {
                [Op::R16(r)] => a.pop(*r),
                [Op::R32(r)] => a.pop(*r),
                [Op::R64(r)] => a.pop(*r),
                [Op::Mem(m)] => a.pop(*m),
                _ => return Err(bad),
            },

            "call" => match ops {
                [Op::Label(l)] => a.call(*l),
                [Op::Imm(v)] => a.call(*v as u64),
                [Op::R32(r)] => a.call(*r),
                [Op::R64(r)] => a.call(*r),
                [Op::Mem(m)] => a.call(*m),
                _ => return Err(bad),
            },
            "jmp" => match ops {
                [Op::Label(l)] => a.jmp(*l),
                [Op::Imm(v)] => a.jmp(*v as u64),
                [Op::R32(r)] => a.jmp(*r),
                [Op::R64(r)] => a.jmp(*r),
                [Op::Mem(m)] => a.jmp(*m),
                _ => return Err(bad),
            },

            "je" | "jz" => jcc_forms!(a, je, ops, bad),
            "jne" | "jnz" => jcc_forms!(a, jne, ops, bad),
            "ja" | "jnbe" => jcc_forms!(a, ja, ops, bad),
            "jae" | "jnb" | "jnc" => jcc_forms!(a, jae, ops, bad),
            "jb" | "jnae" | "jc" => jcc_forms!(a, jb, ops, bad),
            "jbe" | "jna" => jcc_forms!(a, jbe, ops, bad),
            "jg" | "jnle" => jcc_forms!(a, jg, ops, bad),
            "jge" | "jnl" => jcc_forms!(a, jge, ops, bad),
            "jl" | "jnge" => jcc_forms!(a, jl, ops, bad),
            "jle" | "jng" => jcc_forms!(a, jle, ops, bad),
            "jo" => jcc_forms!(a, jo, ops, bad),
            "jno" => jcc_forms!(a, jno, ops, bad),
            "js" => jcc_forms!(a, js, ops, bad),
            "jns" => jcc_forms!(a, jns, ops, bad),
            "jp" | "jpe" => jcc_forms!(a, jp, ops, bad),
            "jnp" | "jpo" => jcc_forms!(a, jnp, ops, bad),

            "sete" | "setz" => setcc_forms!(a, sete, ops, bad),
            "setne" | "setnz" => setcc_forms!(a, setne, ops, bad),
            "seta" | "setnbe" => setcc_forms!(a, seta, ops, bad),
            "setae" | "setnb" | "setnc" => setcc_forms!(a, setae, ops, bad),
            "setb" | "setnae" | "setc" => setcc_forms!(a, setb, ops, bad),
            "setbe" | "setna" => setcc_forms!(a, setbe, ops, bad),
            "setg" | "setnle" => setcc_forms!(a, setg, ops, bad),
            "setge" | "setnl" => setcc_forms!(a, setge, ops, bad),
            "setl" | "setnge" => setcc_forms!(a, setl, ops, bad),
            "setle" | "setng" => setcc_forms!(a, setle, ops, bad),
            "seto" => setcc_forms!(a, seto, ops, bad),
            "setno" => setcc_forms!(a, setno, ops, bad),
            "sets" => setcc_forms!(a, sets, ops, bad),
            "setns" => setcc_forms!(a, setns, ops, bad),
            "setp" | "setpe" => setcc_forms!(a, setp, ops, bad),
            "setnp" | "setpo" => setcc_forms!(a, setnp, ops, bad),

            "cmove" | "cmovz" => cmov_forms!(a, cmove, ops, bad),
            "cmovne" | "cmovnz" => cmov_forms!(a, cmovne, ops, bad),
            "cmova" | "cmovnbe" => cmov_forms!(a, cmova, ops, bad),
            "cmovae" | "cmovnb" | "cmovnc" => cmov_forms!(a, cmovae, ops, bad),
            "cmovb" | "cmovnae" | "cmovc" => cmov_forms!(a, cmovb, ops, bad),
            "cmovbe" | "cmovna" => cmov_forms!(a, cmovbe, ops, bad),
            "cmovg" | "cmovnle" => cmov_forms!(a, cmovg, ops, bad),
            "cmovge" | "cmovnl" => cmov_forms!(a, cmovge, ops, bad),
            "cmovl" | "cmovnge" => cmov_forms!(a, cmovl, ops, bad),
            "cmovle" | "cmovng" => cmov_forms!(a, cmovle, ops, bad),
            "cmovo" => cmov_forms!(a, cmovo, ops, bad),
            "cmovno" => cmov_forms!(a, cmovno, ops, bad),
            "cmovs" => cmov_forms!(a, cmovs, ops, bad),
            "cmovns" => cmov_forms!(a, cmovns, ops, bad),
            "cmovp" | "cmovpe" => cmov_forms!(a, cmovp, ops, bad),
            "cmovnp" | "cmovpo" => cmov_forms!(a, cmovnp, ops, bad),

            "ret" => match ops {
                [] => a.ret(),
                [Op::Imm(v)] => a.ret_1(imm32(*v)?),
                _ => return Err(bad),
            },

            "movss" => sse_move_forms!(a, movss, ops, bad),
            "movaps" => sse_move_forms!(a, movaps, ops, bad),
            "movups" => sse_move_forms!(a, movups, ops, bad),
            "addss" => sse_forms!(a, addss, ops, bad),
            "subss" => sse_forms!(a, subss, ops, bad),
            "mulss" => sse_forms!(a, mulss, ops, bad),
            "divss" => sse_forms!(a, divss, ops, bad),
            "minss" => sse_forms!(a, minss, ops, bad),
            "maxss" => sse_forms!(a, maxss, ops, bad),
            "sqrtss" => sse_forms!(a, sqrtss, ops, bad),
            "comiss" => sse_forms!(a, comiss, ops, bad),
            "ucomiss" => sse_forms!(a, ucomiss, ops, bad),
            "xorps" => sse_forms!(a, xorps, ops, bad),
            "andps" => sse_forms!(a, andps, ops, bad),
            "orps" => sse_forms!(a, orps, ops, bad),
            "cvtsi2ss" => match ops {
                [Op::Xmm(d), Op::R32(s)] => a.cvtsi2ss(*d, *s),
                [Op::Xmm(d), Op::R64(s)] => a.cvtsi2ss(*d, *s),
                [Op::Xmm(d), Op::Mem(s)] => a.cvtsi2ss(*d, *s),
                _ => return Err(bad),
            },
            "cvttss2si" => match ops {
                [Op::R32(d), Op::Xmm(s)] => a.cvttss2si(*d, *s),
                [Op::R64(d), Op::Xmm(s)] => a.cvttss2si(*d, *s),
                [Op::R32(d), Op::Mem(s)] => a.cvttss2si(*d, *s),
                [Op::R64(d), Op::Mem(s)] => a.cvttss2si(*d, *s),
                _ => return Err(bad),
            },

            "movsd" => sse_move_forms!(a, movsd_2, ops, bad),
            "movapd" => sse_move_forms!(a, movapd, ops, bad),
            "movupd" => sse_move_forms!(a, movupd, ops, bad),
            "addsd" => sse_forms!(a, addsd, ops, bad),
            "subsd" => sse_forms!(a, subsd, ops, bad),
            "mulsd" => sse_forms!(a, mulsd, ops, bad),
            "divsd" => sse_forms!(a, divsd, ops, bad),
            "minsd" => sse_forms!(a, minsd, ops, bad),
            "maxsd" => sse_forms!(a, maxsd, ops, bad),
            "sqrtsd" => sse_forms!(a, sqrtsd, ops, bad),
            "comisd" => sse_forms!(a, comisd, ops, bad),
            "ucomisd" => sse_forms!(a, ucomisd, ops, bad),
            "xorpd" => sse_forms!(a, xorpd, ops, bad),
            "andpd" => sse_forms!(a, andpd, ops, bad),
            "orpd" => sse_forms!(a, orpd, ops, bad),
            "cvtss2sd" => sse_forms!(a, cvtss2sd, ops, bad),
            "cvtsd2ss" => sse_forms!(a, cvtsd2ss, ops, bad),
            "cvtsi2sd" => match ops {
                [Op::Xmm(d), Op::R32(s)] => a.cvtsi2sd(*d, *s),
                [Op::Xmm(d), Op::R64(s)] => a.cvtsi2sd(*d, *s),
                [Op::Xmm(d), Op::Mem(s)] => a.cvtsi2sd(*d, *s),
                _ => return Err(bad),
            },
            "cvttsd2si" => match ops {
                [Op::R32(d), Op::Xmm(s)] => a.cvttsd2si(*d, *s),
                [Op::R64(d), Op::Xmm(s)] => a.cvttsd2si(*d, *s),
                [Op::R32(d), Op::Mem(s)] => a.cvttsd2si(*d, *s),
                [Op::R64(d), Op::Mem(s)] => a.cvttsd2si(*d, *s),
                _ => return Err(bad),
            },

            "movd" => match ops {
                [Op::Xmm(d), Op::R32(s)] => a.movd(*d, *s),
                [Op::R32(d), Op::Xmm(s)] => a.movd(*d, *s),
                [Op::Xmm(d), Op::Mem(s)] => a.movd(*d, *s),
                [Op::Mem(d), Op::Xmm(s)] => a.movd(*d, *s),
                _ => return Err(bad),
            },
            "movq" => match ops {
                [Op::Xmm(d), Op::R64(s)] => a.movq(*d, *s),
                [Op::R64(d), Op::Xmm(s)] => a.movq(*d, *s),
                [Op::Xmm(d), Op::Xmm(s)] => a.movq(*d, *s),
                [Op::Xmm(d), Op::Mem(s)] => a.movq(*d, *s),
                [Op::Mem(d), Op::Xmm(s)] => a.movq(*d, *s),
                _ => return Err(bad),
            },

            _ if !ops.is_empty() && is_nullary(mnemonic) => return Err(bad),
            "nop" => a.nop(),
            "int3" => a.int3(),
            "pushfq" => a.pushfq(),
            "popfq" => a.popfq(),
            "cdq" => a.cdq(),
            "cqo" => a.cqo(),
            "leave" => a.leave(),
            "pause" => a.pause(),
            "ud2" => a.ud2(),

            _ => return Err(AsmError::unsupported(format!("`{}`", mnemonic))),
        };

        result.map_err(|e| AsmError::operand(format!("`{}`: {}", mnemonic, e)))
    }
}

fn is_nullary(mnemonic: &str) -> bool {
    matches!(
        mnemonic,
        "nop" | "int3" | "pushfq" | "popfq" | "cdq" | "cqo" | "leave" | "pause" | "ud2"
    )
}

/// Group consecutive labels and reject duplicates and trailing labels
fn label_aliases(statements: &[Statement]) -> AsmResult<HashMap<String, String>> {
    let mut aliases = HashMap::new();
    let mut group: Option<(&String, &Statement)> = None;

    for statement in statements {
        match &statement.kind {
            StatementKind::Label(name) => {
                if aliases.contains_key(name) {
                    return Err(AsmError::syntax(format!("label `{}` defined twice", name))
                        .at(statement.line, &statement.text));
                }
                let (first, _) = *group.get_or_insert((name, statement));
                aliases.insert(name.clone(), first.clone());
            }
            _ => group = None,
        }
    }

    if let Some((name, statement)) = group {
        return Err(AsmError::syntax(format!(
            "label `{}` is not followed by an instruction",
            name
        ))
        .at(statement.line, &statement.text));
    }

    Ok(aliases)
}

/// Assemble parsed statements as if placed at `address`
///
/// Branch sizes are fixed by the source (`short` or near), so the length of
/// the output never depends on `address`.
pub fn encode(statements: &[Statement], bitness: u32, address: u64) -> AsmResult<Vec<u8>> {
    let mut lowering = Lowering::new(bitness, address, statements)?;
    // Statement index of every emitted instruction
    let mut owners = Vec::new();

    for (index, statement) in statements.iter().enumerate() {
        lowering
            .statement(statement)
            .map_err(|e| e.at(statement.line, &statement.text))?;
        owners.resize(lowering.asm.instructions().len(), index);
    }

    let instructions = lowering.asm.instructions();
    if instructions.is_empty() {
        return Ok(Vec::new());
    }

    let block = InstructionBlock::new(instructions, address);
    let options = BlockEncoderOptions::DONT_FIX_BRANCHES
        | BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS
        | BlockEncoderOptions::RETURN_CONSTANT_OFFSETS;
    let mut result = BlockEncoder::encode(bitness, block, options).map_err(|e| {
        let error = AsmError::from(e);
        match failing_instruction(instructions, bitness, address)
            .and_then(|i| owners.get(i))
            .and_then(|&s| statements.get(s))
        {
            Some(statement) => error.at(statement.line, &statement.text),
            None => error,
        }
    })?;

    for &(index, displacement) in &lowering.rip_relative {
        write_rip_displacement(&mut result, index, displacement)?;
    }
    Ok(result.code_buffer)
}

/// Replace the placeholder target of a `[rip + disp]` operand with its disp32
fn write_rip_displacement(
    result: &mut BlockEncoderResult,
    index: usize,
    displacement: i32,
) -> AsmResult<()> {
    let missing = || AsmError::encoding("no displacement recorded for a rip-relative operand");
    let start = *result.new_instruction_offsets.get(index).ok_or_else(missing)? as usize;
    let constants = result.constant_offsets.get(index).ok_or_else(missing)?;
    if constants.displacement_size() != 4 {
        return Err(missing());
    }

    let at = start + constants.displacement_offset();
    result
        .code_buffer
        .get_mut(at..at + 4)
        .ok_or_else(missing)?
        .copy_from_slice(&displacement.to_le_bytes());
    Ok(())
}

/// Index of the first instruction that cannot be encoded at its final address
///
/// Lengths do not depend on placement, so the block layout can be rebuilt one
/// instruction at a time after the block encoder rejected it as a whole.
fn failing_instruction(instructions: &[Instruction], bitness: u32, address: u64) -> Option<usize> {
    let mut encoder = Encoder::try_new(bitness).ok()?;

    let mut starts = Vec::with_capacity(instructions.len());
    // Label ids are the original instruction ips
    let mut labels = HashMap::new();
    let mut ip = address;
    for (index, instruction) in instructions.iter().enumerate() {
        let len = match encoder.encode(instruction, relative_target(instruction).unwrap_or(ip)) {
            Ok(len) => len as u64,
            Err(_) => return Some(index),
        };
        if instruction.ip() != 0 {
            labels.insert(instruction.ip(), ip);
        }
        starts.push(ip);
        ip = ip.wrapping_add(len);
    }

    instructions.iter().zip(starts).position(|(instruction, start)| {
        let mut placed = *instruction;
        if let Some(&target) = relative_target(instruction).and_then(|t| labels.get(&t)) {
            retarget(&mut placed, target);
        }
        encoder.encode(&placed, start).is_err()
    })
}

/// Branch target or rip-relative address of an instruction
fn relative_target(instruction: &Instruction) -> Option<u64> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instruction.near_branch_target())
        }
        _ if instruction.is_ip_rel_memory_operand() => Some(instruction.ip_rel_memory_address()),
        _ => None,
    }
}

fn retarget(instruction: &mut Instruction, target: u64) {
    match instruction.op0_kind() {
        OpKind::NearBranch16 => instruction.set_near_branch16(target as u16),
        OpKind::NearBranch32 => instruction.set_near_branch32(target as u32),
        OpKind::NearBranch64 => instruction.set_near_branch64(target),
        _ => instruction.set_memory_displacement64(target),
    }
}
