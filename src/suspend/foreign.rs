/*!
 * Foreign Runtime Oracle
 *
 * Holds the embedder-supplied predicate telling whether a thread belongs to
 * the other runtime sharing this process. Reads are lock-free so initiators
 * can consult it on every suspend request.
 */

use crate::core::traits::ThreadChecker;
use crate::core::types::NativeThreadId;
use arc_swap::ArcSwapOption;
use std::sync::Arc;

struct Checker(Box<ThreadChecker>);

/// Replaceable foreign-thread ownership predicate
pub struct ForeignThreadOracle {
    checker: ArcSwapOption<Checker>,
}

impl ForeignThreadOracle {
    pub const fn new() -> Self {
        Self {
            checker: ArcSwapOption::const_empty(),
        }
    }

    /// Install or replace the predicate
    pub fn register<F>(&self, checker: F)
    where
        F: Fn(NativeThreadId) -> bool + Send + Sync + 'static,
    {
        self.checker.store(Some(Arc::new(Checker(Box::new(checker)))));
    }

    pub fn clear(&self) {
        self.checker.store(None);
    }

    pub fn is_registered(&self) -> bool {
        self.checker.load().is_some()
    }

    /// False when no predicate is registered
    pub fn is_owned(&self, tid: NativeThreadId) -> bool {
        self.checker
            .load()
            .as_ref()
            .is_some_and(|checker| (checker.0)(tid))
    }
}

impl Default for ForeignThreadOracle {
    fn default() -> Self {
        Self::new()
    }
}
