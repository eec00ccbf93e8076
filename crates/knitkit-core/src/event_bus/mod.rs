//! # Event Bus Module
//!
//! Publish/subscribe distribution of controller events.
//!
//! - Publishers emit typed events without knowing subscribers
//! - Subscribers filter by category and receive events of interest
//! - Handlers run synchronously on the publishing thread
//!
//! ## Usage
//!
//! ```rust,ignore
//! use knitkit_core::event_bus::{AppEvent, EventBus, EventCategory, EventFilter};
//!
//! let bus = EventBus::new();
//! let subscription = bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Execution]),
//!     |event| {
//!         if let AppEvent::Execution(e) = event {
//!             println!("{}", e.description());
//!         }
//!     },
//! );
//! bus.unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
