//! Admission control for real-time sessions.
//!
//! Admission decides whether a session may start; continuation decides
//! whether a running one may keep going. A session that was admitted is
//! only stopped when the balance falls through the hard floor, never on a
//! soft warning.

pub mod controller;
pub mod estimate;
pub mod session;

pub use controller::{
    AdmissionConfig, AdmissionController, AdmissionDecision, AdmissionWarning, Remediation,
    RuntimeVerdict,
};
pub use estimate::{
    CostEstimate, EstimateLine, Estimator, MAX_PLANNED_MINUTES, PostProcessing, PostProcessingCosts, ServiceProfile,
};
pub use session::{Opened, Session, SessionRegistry};
