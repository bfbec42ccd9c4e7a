//! Bind EPICS-style driver parameters to network shared variables.
//!
//! A configuration document names, for each parameter, the shared variable it mirrors,
//! the type it is presented as, and how it talks to the variable: by subscription,
//! through a client-side buffer, by reading on demand, or by writing. This crate
//! keeps a parameter store up to date with those variables and pushes writes back.
//!
//! The pieces are separated as:
//!
//! - The data the variable service exchanges, in module [cnv], and its conversion to
//!   local values in [convert] and [timestamp].
//! - Loading the configuration document, in [config], into a [binding::Registry].
//! - [services::NetVarService], the trait used to talk to the variable service, with
//!   an in-process [services::LoopbackService].
//! - [store::ParamStore], the trait used to talk to the parameter store, with an
//!   in-memory [store::ParamTable] that broadcasts changes.
//! - The [engine], which applies every received value to the store, mirroring data
//!   quality and alarms, and the [connection] manager that opens every subscription,
//!   reader and writer and discovers alarm properties.
//! - A [DriverBuilder] that starts all of this and returns a [DriverHandle] for reads
//!   and writes by parameter name.
//!
//! ## Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use netshrvar::{DriverBuilder, cnv::CnvData, services::LoopbackService, store::ParamTable};
//!
//! const CONFIG: &str = r#"
//! <netvar>
//!   <section name="demo">
//!     <param name="temperature" type="float64" access="R" netvar="\\localhost\lib\temp"/>
//!   </section>
//! </netvar>"#;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = Arc::new(LoopbackService::new());
//!     service.define(r"\\localhost\lib\temp");
//!     let store = Arc::new(Mutex::new(ParamTable::new()));
//!     let mut driver = DriverBuilder::from_document(CONFIG, "demo")
//!         .start(service.clone(), store)
//!         .await
//!         .unwrap();
//!     service.publish(r"\\localhost\lib\temp", CnvData::scalar(21.5f64));
//!     assert_eq!(driver.read_f64("temperature").unwrap().0, 21.5);
//!     driver.stop().await;
//! }
//! ```

pub mod binding;
pub mod cnv;
pub mod config;
pub mod connection;
pub mod convert;
pub mod driver;
pub mod engine;
pub mod services;
pub mod store;
pub mod timestamp;
mod utils;

pub use crate::driver::{DriverBuilder, DriverError, DriverHandle};
pub use crate::engine::{Engine, EngineError, Timeouts};
