use serde::{Deserialize, Serialize};

pub type LvalId = u64;
pub type LabelSetId = u64;
pub type DuaId = u64;
pub type DuaBytesId = u64;
pub type AttackPointId = u64;
pub type BugId = u64;
pub type BuildId = u64;
pub type RunId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub line: u32,
    pub column: u32,
}

/// A source range as reported by the instrumentor's analysis pass.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub filename: String,
    pub begin: Loc,
    pub end: Loc,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceLval {
    pub id: LvalId,
    pub loc: SourceLocation,
    pub ast_name: String,
}

/// Taint labels observed at byte `ptr` of `input_file`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    pub id: LabelSetId,
    pub ptr: u64,
    pub input_file: String,
    pub labels: Vec<u32>,
}

/// A dead, uncomplicated and available data slot.
///
/// `viable_bytes` is ordered: position `i` holds the label set backing byte `i`
/// of the lvalue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dua {
    pub id: DuaId,
    pub lval: LvalId,
    pub all_labels: Vec<u32>,
    pub input_file: String,
    pub max_tcn: u32,
    pub max_cardinality: u32,
    pub instr: u64,
    pub fake: bool,
    #[serde(default)]
    pub viable_bytes: Vec<LabelSetId>,
}

/// Half-open byte range `[low, high)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub low: u32,
    pub high: u32,
}

/// A slice of one DUA usable as a trigger source. `all_labels` are the input
/// file offsets feeding the selected bytes, in byte order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DuaBytes {
    pub id: DuaBytesId,
    pub dua: DuaId,
    pub selected: ByteRange,
    pub all_labels: Vec<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AttackPointKind {
    FunctionCall,
    PointerRead,
    PointerWrite,
    QueryPoint,
}

impl AttackPointKind {
    /// Integer code used by the instrumentor and the persisted schema.
    pub fn code(self) -> i64 {
        match self {
            AttackPointKind::FunctionCall => 0,
            AttackPointKind::PointerRead => 1,
            AttackPointKind::PointerWrite => 2,
            AttackPointKind::QueryPoint => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AttackPointKind::FunctionCall),
            1 => Some(AttackPointKind::PointerRead),
            2 => Some(AttackPointKind::PointerWrite),
            3 => Some(AttackPointKind::QueryPoint),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttackPointKind::FunctionCall => "ATP_FUNCTION_CALL",
            AttackPointKind::PointerRead => "ATP_POINTER_READ",
            AttackPointKind::PointerWrite => "ATP_POINTER_WRITE",
            AttackPointKind::QueryPoint => "ATP_QUERY_POINT",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttackPoint {
    pub id: AttackPointId,
    pub loc: SourceLocation,
    pub kind: AttackPointKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BugKind {
    PointerAdd,
    ReturnBuffer,
    RelativeWrite,
    PrintfLeak,
}

impl BugKind {
    pub fn code(self) -> i64 {
        match self {
            BugKind::PointerAdd => 0,
            BugKind::ReturnBuffer => 1,
            BugKind::RelativeWrite => 2,
            BugKind::PrintfLeak => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(BugKind::PointerAdd),
            1 => Some(BugKind::ReturnBuffer),
            2 => Some(BugKind::RelativeWrite),
            3 => Some(BugKind::PrintfLeak),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BugKind::PointerAdd => "BUG_PTR_ADD",
            BugKind::ReturnBuffer => "BUG_RET_BUFFER",
            BugKind::RelativeWrite => "BUG_REL_WRITE",
            BugKind::PrintfLeak => "BUG_PRINTF_LEAK",
        }
    }

    /// Leak bugs manifest as changed output rather than a crash.
    pub fn is_leak(self) -> bool {
        matches!(self, BugKind::PrintfLeak)
    }
}

/// A candidate bug. Whether it is a control (fake) is decided by the DUA
/// behind `trigger`, never stored here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Bug {
    pub id: BugId,
    pub kind: BugKind,
    pub trigger: DuaBytesId,
    pub trigger_lval: Option<LvalId>,
    pub atp: AttackPointId,
    pub max_liveness: f64,
    #[serde(default)]
    pub extra_duas: Vec<DuaBytesId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub id: BuildId,
    pub bugs: Vec<BugId>,
    pub compile: bool,
    pub output: String,
}

/// One execution of the built program. `fuzzed` is `None` for a baseline run
/// on the unmodified input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: RunId,
    pub build: BuildId,
    pub fuzzed: Option<BugId>,
    pub exit_code: i32,
    pub output: String,
    pub success: bool,
}
