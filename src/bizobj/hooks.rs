//! Observer surface around bizobj operations.

use crate::constants::Code;
use crate::cursor::Cursor;

/// Named points at which a bizobj consults its observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    First,
    Prior,
    Next,
    Last,
    /// Any change of the current row, including new and seek.
    PointerMove,
    New,
    Delete,
    DeleteAll,
    Save,
    Cancel,
    Requery,
}

/// User logic attached to a bizobj.
///
/// `before` returning `false` vetoes the operation, which then reports
/// [`Code::FileCancel`] without touching any state. Every other method only
/// observes.
pub trait BizobjHooks {
    fn before(&self, _hook: Hook, _cursor: &Cursor) -> bool {
        true
    }

    fn after(&self, _hook: Hook, _code: Code) {}

    /// Fires after every save and delete.
    fn after_change(&self, _code: Code) {}

    /// Check the current row before it is written. An `Err` blocks the save
    /// and its message lands in the bizobj's error log.
    fn validate_record(&self, _cursor: &Cursor) -> Result<(), String> {
        Ok(())
    }

    /// A new row was added and defaults applied; fields may still be set.
    fn on_new(&self, _cursor: &mut Cursor) {}

    /// A new row was written.
    fn on_save_new(&self, _cursor: &Cursor) {}

    fn on_delete_last_record(&self) {}
}

/// Observer that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl BizobjHooks for NoHooks {}
