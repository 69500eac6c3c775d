//! Background Services Module
//!
//! ```text
//! ┌──────────────┐  tick   ┌──────────────┐  on_start / on_stop  ┌──────────────┐
//! │ FastFailCheck│◀────────│   WatchDog   │─────────────────────▶│  listeners   │
//! └──────────────┘         └──────────────┘  ensure_started      │ (ingest,     │
//!                                 ▲          heartbeat           │  buffer)     │
//!                                 │                              └──────────────┘
//!                         ServiceManager
//! ```
//!
//! # Services
//!
//! - **ServiceManager**: Starts and stops background services together
//! - **WatchDog**: Translates breaker state into pause/resume signals

pub mod framework;
pub mod watchdog;

pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use watchdog::{Signal, WatchDog, WatchDogConfig, WatchDogListener};
