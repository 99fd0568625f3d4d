//! Result codes, referential-integrity policies and row-state keys.
//!
//! Every public cursor and bizobj operation reports its outcome with a [`Code`].
//! The set is closed: new failure modes map onto one of these codes or surface
//! as a [`DaboError`](crate::error::DaboError) before a code is produced.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Key under which a row's original values are exported.
pub const MEMENTO: &str = "dabo-memento";

/// Key flagging an exported row that has not been persisted yet.
pub const NEW_RECORD_FLAG: &str = "dabo-newrec";

/// Outcome of a cursor or bizobj operation.
///
/// Success codes map to `0`; vetoes and failures are negative, matching the
/// numeric values UI layers historically compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    FileOk,
    /// Operation vetoed by a hook, a validation rule or a referential policy.
    FileCancel,
    FileNoRecords,
    FileBof,
    FileEof,
    RequerySuccess,
    RequeryError,
    UpdateOk,
    UpdateNoRows,
}

impl Code {
    /// Returns true for the three success codes.
    pub fn is_ok(&self) -> bool {
        matches!(self, Code::FileOk | Code::RequerySuccess | Code::UpdateOk)
    }

    /// Numeric value of the code.
    pub fn value(&self) -> i32 {
        match self {
            Code::FileOk | Code::RequerySuccess | Code::UpdateOk => 0,
            Code::FileCancel | Code::RequeryError => -1,
            Code::FileNoRecords | Code::UpdateNoRows => -2,
            Code::FileBof => -3,
            Code::FileEof => -4,
        }
    }

    /// The constant name, e.g. `FILE_OK`.
    pub fn name(&self) -> &'static str {
        match self {
            Code::FileOk => "FILE_OK",
            Code::FileCancel => "FILE_CANCEL",
            Code::FileNoRecords => "FILE_NORECORDS",
            Code::FileBof => "FILE_BOF",
            Code::FileEof => "FILE_EOF",
            Code::RequerySuccess => "REQUERY_SUCCESS",
            Code::RequeryError => "REQUERY_ERROR",
            Code::UpdateOk => "UPDATE_OK",
            Code::UpdateNoRows => "UPDATE_NOROWS",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Policy applied across a parent/child edge on delete, update or insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefIntegrity {
    #[default]
    Ignore,
    Restrict,
    Cascade,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Code::FileOk, true, 0)]
    #[case(Code::RequerySuccess, true, 0)]
    #[case(Code::UpdateOk, true, 0)]
    #[case(Code::FileCancel, false, -1)]
    #[case(Code::RequeryError, false, -1)]
    #[case(Code::FileNoRecords, false, -2)]
    #[case(Code::UpdateNoRows, false, -2)]
    #[case(Code::FileBof, false, -3)]
    #[case(Code::FileEof, false, -4)]
    fn test_code_values(#[case] code: Code, #[case] ok: bool, #[case] value: i32) {
        assert_eq!(code.is_ok(), ok);
        assert_eq!(code.value(), value);
    }

    #[rstest]
    fn test_code_display_uses_constant_name() {
        assert_eq!(Code::FileNoRecords.to_string(), "FILE_NORECORDS");
        assert_eq!(Code::UpdateNoRows.to_string(), "UPDATE_NOROWS");
    }

    #[rstest]
    fn test_ref_integrity_deserializes_lowercase() {
        let policy: RefIntegrity = serde_json::from_str("\"cascade\"").unwrap();
        assert_eq!(policy, RefIntegrity::Cascade);
        assert_eq!(RefIntegrity::default(), RefIntegrity::Ignore);
    }
}
