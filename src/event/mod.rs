//! # Event Notification
//!
//! The event module provides the notification primitive the request scheduler is
//! built on. A bus carries one argument type; subscribers register handlers and are
//! notified every time the bus fires.
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐  fire(args)  ┌──────────┐  handler(args)  ┌────────────┐
//! │Publisher │─────────────▶│ EventBus │────────────────▶│Subscription│
//! └──────────┘              └──────────┘                 └────────────┘
//!                                │ snapshot of live subscriptions
//!                                ▼ taken when the firing starts
//! ```
//!
//! 1. Subscribers register handlers with `subscribe`, `subscribe_once` or `subscribe_concurrent`
//! 2. A publisher calls `fire`, which snapshots the subscriber list
//! 3. Every handler in the snapshot is invoked in subscription order
//!
//! ## Usage Examples
//!
//! ### Awaiting the next firing
//!
//! ```rust,no_run
//! # use budgetkv::event::event_bus::EventBus;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: EventBus<u64> = EventBus::new();
//! let waiter = tokio::spawn({
//!     let bus = bus.clone();
//!     async move { bus.wait().await }
//! });
//! while bus.subscriber_count() == 0 {
//!     tokio::task::yield_now().await;
//! }
//! bus.fire(42)?;
//! assert_eq!(waiter.await??, 42);
//! # Ok(())
//! # }
//! ```

pub mod event_bus;
