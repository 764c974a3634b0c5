//! # Event Bus Module
//!
//! Publish/subscribe channel for connection and print job events. Each
//! `PrinterHost` owns one bus; observers either register a synchronous
//! handler or take an async receiver.
//!
//! ```rust,ignore
//! let bus = EventBus::new();
//! let id = bus.subscribe(EventFilter::Categories(vec![EventCategory::Job]), |event| {
//!     println!("{}", event.description());
//! });
//! bus.unsubscribe(id);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
