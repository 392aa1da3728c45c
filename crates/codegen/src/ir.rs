//! Per-scope instruction sequences and the assembler seam.

use alloc::{boxed::Box, string::String, vec::Vec};

use crate::{IndexMap, IndexSet};
use pylower_compiler_core::{
    OneIndexed, SourceLocation,
    bytecode::{CodeFlags, CodeObject, CodeUnit, ConstantData, Instruction, Label, OpArg},
};
use thiserror::Error;

/// Metadata for a code unit
#[derive(Clone, Debug)]
pub struct CodeUnitMetadata {
    pub name: String,
    pub qualname: Option<String>,
    pub consts: IndexSet<ConstantData>,
    pub names: IndexSet<String>,
    pub varnames: IndexSet<String>,
    pub cellvars: IndexSet<String>,
    pub freevars: IndexSet<String>,
    /// Names an inlined comprehension forces into fast locals, and whether
    /// that override is currently active.
    pub fast_hidden: IndexMap<String, bool>,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub firstlineno: OneIndexed,
}

impl CodeUnitMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>, firstlineno: OneIndexed) -> Self {
        Self {
            name: name.into(),
            qualname: None,
            consts: IndexSet::default(),
            names: IndexSet::default(),
            varnames: IndexSet::default(),
            cellvars: IndexSet::default(),
            freevars: IndexSet::default(),
            fast_hidden: IndexMap::default(),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            firstlineno,
        }
    }

    #[must_use]
    pub fn is_fast_hidden(&self, name: &str) -> bool {
        self.fast_hidden.get(name).copied().unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstructionInfo {
    pub instr: Instruction,
    /// For jumps this holds the raw label id until assembly.
    pub arg: OpArg,
    /// Start and end of the source this came from, or `None` for
    /// artificial instructions.
    pub location: Option<(SourceLocation, SourceLocation)>,
}

impl InstructionInfo {
    /// The jump target of this instruction, if it has one.
    #[must_use]
    pub fn target(&self) -> Option<Label> {
        self.instr
            .label_arg()
            .map(|marker| marker.try_get(self.arg).unwrap_or(Label(self.arg.0)))
    }
}

/// An append-only instruction log for one scope, with symbolic jump labels.
#[derive(Clone, Debug, Default)]
pub struct InstructionSequence {
    instructions: Vec<InstructionInfo>,
    /// Label id to the index of the instruction it precedes.
    label_map: Vec<Option<usize>>,
    duplicate_label: Option<Label>,
    nested: Vec<InstructionSequence>,
}

impl InstructionSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.label_map.len() as u32);
        self.label_map.push(None);
        label
    }

    /// Bind `label` to the position of the next emitted instruction.
    pub fn use_label(&mut self, label: Label) {
        let pos = self.instructions.len();
        match self.label_map.get_mut(label.0 as usize) {
            Some(slot @ None) => *slot = Some(pos),
            Some(Some(_)) => {
                self.duplicate_label.get_or_insert(label);
            }
            None => {
                // label from another sequence; remember it so the assembler rejects it
                self.label_map.resize(label.0 as usize + 1, None);
                self.label_map[label.0 as usize] = Some(pos);
            }
        }
    }

    #[must_use]
    pub fn is_placed(&self, label: Label) -> bool {
        matches!(self.label_map.get(label.0 as usize), Some(Some(_)))
    }

    pub fn push(&mut self, info: InstructionInfo) {
        self.instructions.push(info);
    }

    /// Insert an instruction at `pos`, moving labels placed at or after it.
    pub fn insert(&mut self, pos: usize, info: InstructionInfo) {
        for slot in self.label_map.iter_mut().flatten() {
            if *slot >= pos {
                *slot += 1;
            }
        }
        self.instructions.insert(pos, info);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn instructions(&self) -> &[InstructionInfo] {
        &self.instructions
    }

    #[must_use]
    pub fn last(&self) -> Option<&InstructionInfo> {
        self.instructions.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut InstructionInfo> {
        self.instructions.last_mut()
    }

    /// Whether the next emitted instruction is the target of some label.
    #[must_use]
    pub fn at_label(&self) -> bool {
        let pos = self.instructions.len();
        self.label_map.iter().any(|slot| *slot == Some(pos))
    }

    #[must_use]
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.label_map.get(label.0 as usize).copied().flatten()
    }

    pub fn add_nested(&mut self, child: Self) {
        self.nested.push(child);
    }

    #[must_use]
    pub fn nested(&self) -> &[Self] {
        &self.nested
    }

    /// Opcodes in emission order, mostly useful in tests.
    pub fn opcodes(&self) -> impl Iterator<Item = Instruction> + '_ {
        self.instructions.iter().map(|info| info.instr)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("label {0} is used but never placed")]
    DanglingLabel(Label),
    #[error("label {0} is placed more than once")]
    DuplicateLabel(Label),
}

/// Turns a finished instruction sequence into a code object.
pub trait Assemble {
    fn assemble(
        &self,
        seq: &InstructionSequence,
        metadata: &CodeUnitMetadata,
        flags: CodeFlags,
    ) -> Result<CodeObject, AssembleError>;
}

/// Minimal assembler: resolves labels to instruction offsets and copies the
/// metadata over. Pseudo instructions are kept as they are.
#[derive(Clone, Debug, Default)]
pub struct LabelResolver {
    pub source_path: String,
}

impl LabelResolver {
    #[must_use]
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
        }
    }
}

impl Assemble for LabelResolver {
    fn assemble(
        &self,
        seq: &InstructionSequence,
        metadata: &CodeUnitMetadata,
        flags: CodeFlags,
    ) -> Result<CodeObject, AssembleError> {
        if let Some(label) = seq.duplicate_label {
            return Err(AssembleError::DuplicateLabel(label));
        }

        let mut instructions = Vec::with_capacity(seq.len());
        let mut locations = Vec::with_capacity(seq.len());
        for info in seq.instructions() {
            let arg = match info.target() {
                Some(label) => {
                    let offset = seq
                        .label_position(label)
                        .ok_or(AssembleError::DanglingLabel(label))?;
                    OpArg(offset as u32)
                }
                None => info.arg,
            };
            instructions.push(CodeUnit::new(info.instr, arg));
            locations.push(info.location);
        }

        let to_boxed = |set: &IndexSet<String>| set.iter().cloned().collect::<Box<[_]>>();
        let code = CodeObject {
            instructions: instructions.into_boxed_slice(),
            locations: locations.into_boxed_slice(),
            flags,
            posonlyarg_count: metadata.posonlyargcount,
            arg_count: metadata.argcount,
            kwonlyarg_count: metadata.kwonlyargcount,
            source_path: self.source_path.clone(),
            first_line_number: Some(metadata.firstlineno),
            obj_name: metadata.name.clone(),
            qualname: metadata
                .qualname
                .clone()
                .unwrap_or_else(|| metadata.name.clone()),
            constants: metadata.consts.iter().cloned().collect(),
            names: to_boxed(&metadata.names),
            varnames: to_boxed(&metadata.varnames),
            cellvars: to_boxed(&metadata.cellvars),
            freevars: to_boxed(&metadata.freevars),
        };
        trace!("assembled {}:\n{code}", code.qualname);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylower_compiler_core::bytecode::Arg;

    fn info(instr: Instruction, arg: u32) -> InstructionInfo {
        let location = SourceLocation {
            line: OneIndexed::MIN,
            character_offset: OneIndexed::MIN,
        };
        InstructionInfo {
            instr,
            arg: OpArg(arg),
            location: Some((location, location)),
        }
    }

    fn metadata() -> CodeUnitMetadata {
        CodeUnitMetadata::new("<module>", OneIndexed::MIN)
    }

    #[test]
    fn labels_resolve_to_offsets() {
        let mut seq = InstructionSequence::new();
        let end = seq.new_label();
        seq.push(info(Instruction::Nop, 0));
        seq.push(info(
            Instruction::Jump {
                target: Arg::marker(),
            },
            end.0,
        ));
        seq.push(info(Instruction::Nop, 0));
        seq.use_label(end);
        seq.push(info(Instruction::ReturnValue, 0));

        let code = LabelResolver::default()
            .assemble(&seq, &metadata(), CodeFlags::empty())
            .unwrap();
        assert_eq!(code.instructions[1].arg, OpArg(3));
        assert!(code.label_targets().contains(&Label(3)));
    }

    #[test]
    fn dangling_label_is_rejected() {
        let mut seq = InstructionSequence::new();
        let never = seq.new_label();
        seq.push(info(
            Instruction::PopJumpIfFalse {
                target: Arg::marker(),
            },
            never.0,
        ));
        let err = LabelResolver::default()
            .assemble(&seq, &metadata(), CodeFlags::empty())
            .unwrap_err();
        assert_eq!(err, AssembleError::DanglingLabel(never));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let mut seq = InstructionSequence::new();
        let label = seq.new_label();
        seq.use_label(label);
        seq.push(info(Instruction::Nop, 0));
        seq.use_label(label);
        let err = LabelResolver::default()
            .assemble(&seq, &metadata(), CodeFlags::empty())
            .unwrap_err();
        assert_eq!(err, AssembleError::DuplicateLabel(label));
    }

    #[test]
    fn insert_shifts_labels() {
        let mut seq = InstructionSequence::new();
        let start = seq.new_label();
        seq.use_label(start);
        seq.push(info(Instruction::Nop, 0));
        seq.insert(0, info(Instruction::PushNull, 0));
        assert_eq!(seq.label_position(start), Some(1));
        assert_eq!(seq.opcodes().next(), Some(Instruction::PushNull));
    }
}
