//! Request budget reporting.
//!
//! The backend allows a limited number of calls per operation category in each time
//! window. A [`BudgetOracle`] reports how much of that allowance is left. The
//! scheduler treats the answer as a hint: other work may consume the budget between
//! the check and the call, and the backend itself stays the authority.

use std::time::Duration;

use dashmap::DashMap;
use mockall::automock;
use tokio::time::Instant;
use tracing::trace;

use crate::request::operation::RequestCategory;

/// Reports remaining request allowance per operation category.
#[automock]
pub trait BudgetOracle: Send + Sync {
    fn remaining_budget(&self, category: RequestCategory) -> u32;
}

/// Oracle with a fixed allowance per category that can be adjusted at runtime.
#[derive(Debug)]
pub struct FixedBudget {
    default_allowance: u32,
    overrides: DashMap<RequestCategory, u32>,
}

impl FixedBudget {
    pub fn new(default_allowance: u32) -> Self {
        Self {
            default_allowance,
            overrides: DashMap::new(),
        }
    }

    pub fn set(&self, category: RequestCategory, allowance: u32) {
        self.overrides.insert(category, allowance);
    }

    pub fn reset(&self, category: RequestCategory) {
        self.overrides.remove(&category);
    }
}

impl BudgetOracle for FixedBudget {
    fn remaining_budget(&self, category: RequestCategory) -> u32 {
        self.overrides
            .get(&category)
            .map(|allowance| *allowance)
            .unwrap_or(self.default_allowance)
    }
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    used: u32,
}

/// Oracle that grants `allowance` calls per category in every `window`.
///
/// Calls are recorded with [`WindowBudget::try_consume`]; a metered backend does
/// this before each operation so the reported budget tracks real usage.
#[derive(Debug)]
pub struct WindowBudget {
    allowance: u32,
    window: Duration,
    windows: DashMap<RequestCategory, Window>,
}

impl WindowBudget {
    pub fn new(allowance: u32, window: Duration) -> Self {
        Self {
            allowance,
            window,
            windows: DashMap::new(),
        }
    }

    /// Records one call. Returns `false` if the current window is exhausted.
    pub fn try_consume(&self, category: RequestCategory) -> bool {
        self.with_window(category, |window, allowance| {
            if window.used >= allowance {
                return false;
            }
            window.used += 1;
            true
        })
    }

    fn with_window<R>(&self, category: RequestCategory, f: impl FnOnce(&mut Window, u32) -> R) -> R {
        let now = Instant::now();
        let mut window = self.windows.entry(category).or_insert(Window {
            started_at: now,
            used: 0,
        });
        if now.duration_since(window.started_at) >= self.window {
            trace!("Budget window for {} refreshed", category);
            window.started_at = now;
            window.used = 0;
        }
        f(&mut *window, self.allowance)
    }
}

impl BudgetOracle for WindowBudget {
    fn remaining_budget(&self, category: RequestCategory) -> u32 {
        self.with_window(category, |window, allowance| allowance.saturating_sub(window.used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_budget_overrides() {
        let budget = FixedBudget::new(10);
        assert_eq!(budget.remaining_budget(RequestCategory::Get), 10);

        budget.set(RequestCategory::Get, 0);
        assert_eq!(budget.remaining_budget(RequestCategory::Get), 0);
        assert_eq!(budget.remaining_budget(RequestCategory::Set), 10);

        budget.reset(RequestCategory::Get);
        assert_eq!(budget.remaining_budget(RequestCategory::Get), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_budget_refills() {
        let budget = WindowBudget::new(2, Duration::from_secs(60));
        assert!(budget.try_consume(RequestCategory::Set));
        assert!(budget.try_consume(RequestCategory::Set));
        assert!(!budget.try_consume(RequestCategory::Set));
        assert_eq!(budget.remaining_budget(RequestCategory::Set), 0);
        // categories are budgeted independently
        assert_eq!(budget.remaining_budget(RequestCategory::Get), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(budget.remaining_budget(RequestCategory::Set), 2);
    }

    #[test]
    fn test_window_budget_is_shared_across_threads() {
        let budget = WindowBudget::new(25, Duration::from_secs(3600));
        let granted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        (0..10)
                            .filter(|_| budget.try_consume(RequestCategory::Increment))
                            .count()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });
        assert_eq!(granted, 25);
        assert_eq!(budget.remaining_budget(RequestCategory::Increment), 0);
    }

    #[test]
    fn test_mock_oracle() {
        let mut oracle = MockBudgetOracle::new();
        oracle
            .expect_remaining_budget()
            .withf(|category| *category == RequestCategory::ListKeys)
            .return_const(3u32);
        assert_eq!(oracle.remaining_budget(RequestCategory::ListKeys), 3);
    }
}
