//! Run-wide cap on extra dispatcher worker threads.
//!
//! Every dispatcher owns one worker outside the budget so a nested level can
//! always make progress. Additional workers each hold a [`BudgetPermit`] that
//! returns to the budget when the worker thread exits.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
pub struct ThreadBudget {
    total: usize,
    available: Mutex<usize>,
}

impl ThreadBudget {
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            available: Mutex::new(total),
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Take up to `wanted` permits without blocking.
    pub fn acquire_up_to(self: &Arc<Self>, wanted: usize) -> Vec<BudgetPermit> {
        let granted = {
            let mut available = self.available.lock();
            let granted = wanted.min(*available);
            *available -= granted;
            granted
        };
        (0..granted)
            .map(|_| BudgetPermit {
                budget: Arc::clone(self),
            })
            .collect()
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available = (*available + 1).min(self.total);
    }
}

/// One extra worker thread's share of the budget.
#[derive(Debug)]
pub struct BudgetPermit {
    budget: Arc<ThreadBudget>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.release();
    }
}
