//! Constructing-stack guard.
//!
//! While a new payload is written and its nodes are classified, the
//! allocation sits on the collector's constructing stack. The guard pushes
//! on creation and pops by identity on drop, so nested allocations made from
//! inside a discovery walk unwind in LIFO order even when a construction
//! fails partway.

use crate::allocation::Allocation;
use crate::callbacks::critical_error;
use crate::collector::collector;

pub(crate) struct ConstructionGuard {
    allocation: Allocation,
}

impl ConstructionGuard {
    pub(crate) fn new(allocation: Allocation) -> ConstructionGuard {
        collector().with_state(|state| state.constructing.push(allocation));
        ConstructionGuard { allocation }
    }
}

impl Drop for ConstructionGuard {
    fn drop(&mut self) {
        let found = collector().with_state(|state| {
            match state.constructing.iter().rposition(|a| *a == self.allocation) {
                Some(index) => {
                    state.constructing.remove(index);
                    true
                }
                None => false,
            }
        });

        if !found {
            // An inconsistent constructing stack is a misuse the collector
            // cannot continue past, unwinding or not.
            critical_error(
                "allocation missing from the constructing stack while leaving its construction",
            );
        }
    }
}
