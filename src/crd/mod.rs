//! Custom Resource Definitions for Kronos

mod kronos_app;

pub use kronos_app::{
    AppState, Holiday, IncludedObject, KronosApp, KronosAppSpec, KronosAppStatus, SleepReason,
};
