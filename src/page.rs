use serde::Serialize;
use std::fmt;

/// Identifies one page: the structure (index tree, cache group) that owns it
/// and its page number within that structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PageId {
    pub structure_id: u32,
    pub page_no: u64,
}

impl PageId {
    pub const fn new(structure_id: u32, page_no: u64) -> Self {
        Self {
            structure_id,
            page_no,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.structure_id, self.page_no)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "READ",
            LockMode::Write => "WRITE",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockOp {
    Lock,
    Unlock,
}

impl LockOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockOp::Lock => "LOCK",
            LockOp::Unlock => "UNLOCK",
        }
    }
}

impl fmt::Display for LockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lock-state transition observed by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockEvent {
    pub op: LockOp,
    pub mode: LockMode,
    pub page: PageId,
    /// Monotonic milliseconds from the tracker's clock.
    pub timestamp: u64,
    /// Position in the tracker's history, starting at 1.
    pub seq: u64,
    /// Interned call site, 0 when unknown.
    #[serde(skip)]
    pub site: u32,
}

impl LockEvent {
    // Packed as: bit 0 = op, bit 1 = mode, bits 32.. = call site.
    pub(crate) fn pack_meta(op: LockOp, mode: LockMode, site: u32) -> u64 {
        let op_bit = match op {
            LockOp::Lock => 0,
            LockOp::Unlock => 1,
        };
        let mode_bit = match mode {
            LockMode::Read => 0,
            LockMode::Write => 2,
        };
        ((site as u64) << 32) | mode_bit | op_bit
    }

    pub(crate) fn unpack_meta(meta: u64) -> (LockOp, LockMode, u32) {
        let op = if meta & 1 == 0 {
            LockOp::Lock
        } else {
            LockOp::Unlock
        };
        let mode = if meta & 2 == 0 {
            LockMode::Read
        } else {
            LockMode::Write
        };
        (op, mode, (meta >> 32) as u32)
    }
}

impl fmt::Display for LockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} page={} t={}ms",
            self.seq, self.op, self.mode, self.page, self.timestamp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_packing_keeps_all_fields() {
        for op in [LockOp::Lock, LockOp::Unlock] {
            for mode in [LockMode::Read, LockMode::Write] {
                let meta = LockEvent::pack_meta(op, mode, 0xdead_beef);
                assert_eq!(LockEvent::unpack_meta(meta), (op, mode, 0xdead_beef));
            }
        }
    }

    #[test]
    fn display_is_compact() {
        let event = LockEvent {
            op: LockOp::Lock,
            mode: LockMode::Write,
            page: PageId::new(3, 17),
            timestamp: 250,
            seq: 4,
            site: 0,
        };
        assert_eq!(event.to_string(), "#4 LOCK WRITE page=3/17 t=250ms");
    }
}
