//! Memory layout of the sampled runtime
//!
//! The sampler never links against the runtime it inspects; everything it
//! knows about remote structures comes from the offsets in
//! [`RuntimeLayout`]. The defaults describe a 64-bit Zend Engine 7.4 build.
//! A different build can be described by loading a JSON file with the same
//! shape (missing fields keep their defaults).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stat_shared::Pid;
use std::path::Path;

/// Where to look in a sampled process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub pid: Pid,

    /// Address of the heap structure holding the usage counters
    pub heap: u64,

    /// Address of the pointer to the currently executing frame
    pub frame: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapLayout {
    pub size: usize,
    pub peak: usize,
}

impl Default for HeapLayout {
    fn default() -> Self {
        Self { size: 16, peak: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    /// Bytes copied per frame snapshot
    pub size: usize,
    pub opline: usize,
    pub func: usize,
    pub num_args: usize,
    pub prev: usize,

    /// Offset of the first argument slot from the frame start
    pub args: usize,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            size: 72,
            opline: 0,
            func: 24,
            num_args: 44,
            prev: 48,
            args: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpLayout {
    pub size: usize,
    pub lineno: usize,
    pub opcode: usize,
}

impl Default for OpLayout {
    fn default() -> Self {
        Self {
            size: 32,
            lineno: 24,
            opcode: 28,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionLayout {
    /// Bytes copied per function snapshot
    pub size: usize,
    pub kind: usize,
    pub flags: usize,
    pub name: usize,
    pub scope: usize,
    pub opcodes: usize,
    pub filename: usize,
    pub internal_kind: u8,
    pub user_kind: u8,
    pub immutable_flag: u32,
}

impl Default for FunctionLayout {
    fn default() -> Self {
        Self {
            size: 144,
            kind: 0,
            flags: 4,
            name: 8,
            scope: 16,
            opcodes: 64,
            filename: 136,
            internal_kind: 1,
            user_kind: 2,
            immutable_flag: 1 << 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassLayout {
    pub name: usize,
}

impl Default for ClassLayout {
    fn default() -> Self {
        Self { name: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringLayout {
    pub type_info: usize,
    pub len: usize,
    pub val: usize,
    pub permanent_flag: u32,

    /// Longer strings are cut short and not cached
    pub max_len: usize,
}

impl Default for StringLayout {
    fn default() -> Self {
        Self {
            type_info: 4,
            len: 16,
            val: 24,
            permanent_flag: 1 << 8,
            max_len: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZvalLayout {
    pub size: usize,
    pub value: usize,
    pub kind: usize,
    pub types: ZvalTypes,
}

impl Default for ZvalLayout {
    fn default() -> Self {
        Self {
            size: 16,
            value: 0,
            kind: 8,
            types: ZvalTypes::default(),
        }
    }
}

/// Type tags stored in a value's type byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZvalTypes {
    pub undef: u8,
    pub null: u8,
    pub false_: u8,
    pub true_: u8,
    pub long: u8,
    pub double: u8,
    pub string: u8,
    pub array: u8,
    pub object: u8,
    pub resource: u8,
    pub reference: u8,
}

impl Default for ZvalTypes {
    fn default() -> Self {
        Self {
            undef: 0,
            null: 1,
            false_: 2,
            true_: 3,
            long: 4,
            double: 5,
            string: 6,
            array: 7,
            object: 8,
            resource: 9,
            reference: 10,
        }
    }
}

/// Offsets of every remote structure the sampler reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLayout {
    pub heap: HeapLayout,
    pub frame: FrameLayout,
    pub op: OpLayout,
    pub function: FunctionLayout,
    pub class: ClassLayout,
    pub string: StringLayout,
    pub zval: ZvalLayout,

    /// Opcode names indexed by opcode number
    pub opcode_names: Vec<String>,
}

impl Default for RuntimeLayout {
    fn default() -> Self {
        Self {
            heap: HeapLayout::default(),
            frame: FrameLayout::default(),
            op: OpLayout::default(),
            function: FunctionLayout::default(),
            class: ClassLayout::default(),
            string: StringLayout::default(),
            zval: ZvalLayout::default(),
            opcode_names: ZEND_OPCODES.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl RuntimeLayout {
    /// Load a layout description from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open layout file: {}", path.display()))?;
        let layout: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse layout file: {}", path.display()))?;

        layout.validate()?;
        Ok(layout)
    }

    /// Check that every field read from a snapshot lies inside it
    pub fn validate(&self) -> Result<()> {
        let frame = &self.frame;
        for (name, offset) in [
            ("frame.opline", frame.opline),
            ("frame.func", frame.func),
            ("frame.prev", frame.prev),
        ] {
            if offset + 8 > frame.size {
                anyhow::bail!("{} ({}) outside frame snapshot of {} bytes", name, offset, frame.size);
            }
        }
        if frame.num_args + 4 > frame.size {
            anyhow::bail!("frame.num_args outside frame snapshot");
        }

        let function = &self.function;
        for (name, offset) in [
            ("function.name", function.name),
            ("function.scope", function.scope),
            ("function.opcodes", function.opcodes),
            ("function.filename", function.filename),
        ] {
            if offset + 8 > function.size {
                anyhow::bail!(
                    "{} ({}) outside function snapshot of {} bytes",
                    name,
                    offset,
                    function.size
                );
            }
        }

        if self.op.lineno + 4 > self.op.size || self.op.opcode >= self.op.size {
            anyhow::bail!("op fields outside op snapshot of {} bytes", self.op.size);
        }

        if self.zval.size == 0 || self.zval.kind >= self.zval.size || self.zval.value + 8 > self.zval.size {
            anyhow::bail!("zval fields outside zval of {} bytes", self.zval.size);
        }

        if self.opcode_names.len() > stat_shared::strings::OPCODE_COUNT {
            anyhow::bail!("too many opcode names ({})", self.opcode_names.len());
        }

        Ok(())
    }

    pub fn opcode_names(&self) -> Vec<&str> {
        self.opcode_names.iter().map(String::as_str).collect()
    }

    /// Opcodes whose line number points at the function header rather than
    /// the statement being executed
    pub fn unlined_opcodes(&self) -> [bool; 256] {
        let mut unlined = [false; 256];
        for (code, name) in self.opcode_names.iter().enumerate().take(256) {
            let name = name.strip_prefix("ZEND_").unwrap_or(name);
            if UNLINED_OPCODES.contains(&name) {
                unlined[code] = true;
            }
        }
        unlined
    }
}

const UNLINED_OPCODES: &[&str] = &[
    "FE_FREE",
    "FREE",
    "ASSERT_CHECK",
    "VERIFY_RETURN_TYPE",
    "RECV",
    "RECV_INIT",
    "RECV_VARIADIC",
    "SEND_VAL",
    "SEND_VAR_EX",
    "SEND_VAR_NO_REF_EX",
    "SEND_REF",
    "SEND_UNPACK",
    "ROPE_INIT",
    "ROPE_ADD",
    "ROPE_END",
    "FAST_CONCAT",
    "CAST",
    "BOOL",
    "CASE",
];

/// Zend Engine 7.4 opcode names
const ZEND_OPCODES: &[&str] = &[
    "ZEND_NOP",
    "ZEND_ADD",
    "ZEND_SUB",
    "ZEND_MUL",
    "ZEND_DIV",
    "ZEND_MOD",
    "ZEND_SL",
    "ZEND_SR",
    "ZEND_CONCAT",
    "ZEND_BW_OR",
    "ZEND_BW_AND",
    "ZEND_BW_XOR",
    "ZEND_POW",
    "ZEND_BW_NOT",
    "ZEND_BOOL_NOT",
    "ZEND_BOOL_XOR",
    "ZEND_IS_IDENTICAL",
    "ZEND_IS_NOT_IDENTICAL",
    "ZEND_IS_EQUAL",
    "ZEND_IS_NOT_EQUAL",
    "ZEND_IS_SMALLER",
    "ZEND_IS_SMALLER_OR_EQUAL",
    "ZEND_ASSIGN",
    "ZEND_ASSIGN_DIM",
    "ZEND_ASSIGN_OBJ",
    "ZEND_ASSIGN_STATIC_PROP",
    "ZEND_ASSIGN_OP",
    "ZEND_ASSIGN_DIM_OP",
    "ZEND_ASSIGN_OBJ_OP",
    "ZEND_ASSIGN_STATIC_PROP_OP",
    "ZEND_ASSIGN_REF",
    "ZEND_QM_ASSIGN",
    "ZEND_ASSIGN_OBJ_REF",
    "ZEND_ASSIGN_STATIC_PROP_REF",
    "ZEND_PRE_INC",
    "ZEND_PRE_DEC",
    "ZEND_POST_INC",
    "ZEND_POST_DEC",
    "ZEND_PRE_INC_STATIC_PROP",
    "ZEND_PRE_DEC_STATIC_PROP",
    "ZEND_POST_INC_STATIC_PROP",
    "ZEND_POST_DEC_STATIC_PROP",
    "ZEND_JMP",
    "ZEND_JMPZ",
    "ZEND_JMPNZ",
    "ZEND_JMPZNZ",
    "ZEND_JMPZ_EX",
    "ZEND_JMPNZ_EX",
    "ZEND_CASE",
    "ZEND_CHECK_VAR",
    "ZEND_SEND_VAR_NO_REF_EX",
    "ZEND_CAST",
    "ZEND_BOOL",
    "ZEND_FAST_CONCAT",
    "ZEND_ROPE_INIT",
    "ZEND_ROPE_ADD",
    "ZEND_ROPE_END",
    "ZEND_BEGIN_SILENCE",
    "ZEND_END_SILENCE",
    "ZEND_INIT_FCALL_BY_NAME",
    "ZEND_DO_FCALL",
    "ZEND_INIT_FCALL",
    "ZEND_RETURN",
    "ZEND_RECV",
    "ZEND_RECV_INIT",
    "ZEND_SEND_VAL",
    "ZEND_SEND_VAR_EX",
    "ZEND_SEND_REF",
    "ZEND_NEW",
    "ZEND_INIT_NS_FCALL_BY_NAME",
    "ZEND_FREE",
    "ZEND_INIT_ARRAY",
    "ZEND_ADD_ARRAY_ELEMENT",
    "ZEND_INCLUDE_OR_EVAL",
    "ZEND_UNSET_VAR",
    "ZEND_UNSET_DIM",
    "ZEND_UNSET_OBJ",
    "ZEND_FE_RESET_R",
    "ZEND_FE_FETCH_R",
    "ZEND_EXIT",
    "ZEND_FETCH_R",
    "ZEND_FETCH_DIM_R",
    "ZEND_FETCH_OBJ_R",
    "ZEND_FETCH_W",
    "ZEND_FETCH_DIM_W",
    "ZEND_FETCH_OBJ_W",
    "ZEND_FETCH_RW",
    "ZEND_FETCH_DIM_RW",
    "ZEND_FETCH_OBJ_RW",
    "ZEND_FETCH_IS",
    "ZEND_FETCH_DIM_IS",
    "ZEND_FETCH_OBJ_IS",
    "ZEND_FETCH_FUNC_ARG",
    "ZEND_FETCH_DIM_FUNC_ARG",
    "ZEND_FETCH_OBJ_FUNC_ARG",
    "ZEND_FETCH_UNSET",
    "ZEND_FETCH_DIM_UNSET",
    "ZEND_FETCH_OBJ_UNSET",
    "ZEND_FETCH_LIST_R",
    "ZEND_FETCH_CONSTANT",
    "ZEND_CHECK_FUNC_ARG",
    "ZEND_EXT_STMT",
    "ZEND_EXT_FCALL_BEGIN",
    "ZEND_EXT_FCALL_END",
    "ZEND_EXT_NOP",
    "ZEND_TICKS",
    "ZEND_SEND_VAR_NO_REF",
    "ZEND_CATCH",
    "ZEND_THROW",
    "ZEND_FETCH_CLASS",
    "ZEND_CLONE",
    "ZEND_RETURN_BY_REF",
    "ZEND_INIT_METHOD_CALL",
    "ZEND_INIT_STATIC_METHOD_CALL",
    "ZEND_ISSET_ISEMPTY_VAR",
    "ZEND_ISSET_ISEMPTY_DIM_OBJ",
    "ZEND_SEND_VAL_EX",
    "ZEND_SEND_VAR",
    "ZEND_INIT_USER_CALL",
    "ZEND_SEND_ARRAY",
    "ZEND_SEND_USER",
    "ZEND_STRLEN",
    "ZEND_DEFINED",
    "ZEND_TYPE_CHECK",
    "ZEND_VERIFY_RETURN_TYPE",
    "ZEND_FE_RESET_RW",
    "ZEND_FE_FETCH_RW",
    "ZEND_FE_FREE",
    "ZEND_INIT_DYNAMIC_CALL",
    "ZEND_DO_ICALL",
    "ZEND_DO_UCALL",
    "ZEND_DO_FCALL_BY_NAME",
    "ZEND_PRE_INC_OBJ",
    "ZEND_PRE_DEC_OBJ",
    "ZEND_POST_INC_OBJ",
    "ZEND_POST_DEC_OBJ",
    "ZEND_ECHO",
    "ZEND_OP_DATA",
    "ZEND_INSTANCEOF",
    "ZEND_GENERATOR_CREATE",
    "ZEND_MAKE_REF",
    "ZEND_DECLARE_FUNCTION",
    "ZEND_DECLARE_LAMBDA_FUNCTION",
    "ZEND_DECLARE_CONST",
    "ZEND_DECLARE_CLASS",
    "ZEND_DECLARE_CLASS_DELAYED",
    "ZEND_DECLARE_ANON_CLASS",
    "ZEND_ADD_ARRAY_UNPACK",
    "ZEND_ISSET_ISEMPTY_PROP_OBJ",
    "ZEND_HANDLE_EXCEPTION",
    "ZEND_USER_OPCODE",
    "ZEND_ASSERT_CHECK",
    "ZEND_JMP_SET",
    "ZEND_UNSET_CV",
    "ZEND_ISSET_ISEMPTY_CV",
    "ZEND_FETCH_LIST_W",
    "ZEND_SEPARATE",
    "ZEND_FETCH_CLASS_NAME",
    "ZEND_CALL_TRAMPOLINE",
    "ZEND_DISCARD_EXCEPTION",
    "ZEND_YIELD",
    "ZEND_GENERATOR_RETURN",
    "ZEND_FAST_CALL",
    "ZEND_FAST_RET",
    "ZEND_RECV_VARIADIC",
    "ZEND_SEND_UNPACK",
    "ZEND_YIELD_FROM",
    "ZEND_COPY_TMP",
    "ZEND_BIND_GLOBAL",
    "ZEND_COALESCE",
    "ZEND_SPACESHIP",
    "ZEND_FUNC_NUM_ARGS",
    "ZEND_FUNC_GET_ARGS",
    "ZEND_FETCH_STATIC_PROP_R",
    "ZEND_FETCH_STATIC_PROP_W",
    "ZEND_FETCH_STATIC_PROP_RW",
    "ZEND_FETCH_STATIC_PROP_IS",
    "ZEND_FETCH_STATIC_PROP_FUNC_ARG",
    "ZEND_FETCH_STATIC_PROP_UNSET",
    "ZEND_UNSET_STATIC_PROP",
    "ZEND_ISSET_ISEMPTY_STATIC_PROP",
    "ZEND_FETCH_CLASS_CONSTANT",
    "ZEND_BIND_LEXICAL",
    "ZEND_BIND_STATIC",
    "ZEND_FETCH_THIS",
    "ZEND_SEND_FUNC_ARG",
    "ZEND_ISSET_ISEMPTY_THIS",
    "ZEND_SWITCH_LONG",
    "ZEND_SWITCH_STRING",
    "ZEND_IN_ARRAY",
    "ZEND_COUNT",
    "ZEND_GET_CLASS",
    "ZEND_GET_CALLED_CLASS",
    "ZEND_GET_TYPE",
    "ZEND_ARRAY_KEY_EXISTS",
];
