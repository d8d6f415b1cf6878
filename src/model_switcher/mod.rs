//! Model Switcher - one resident backend at a time on a shared GPU
//!
//! Several inference servers are configured but only one fits in accelerator memory. The
//! switcher sits between incoming requests and the backends:
//!
//! ```text
//! Request → ModelSwitcher → [stop old unit, start new unit, probe] → Forward
//! ```
//!
//! ## Key Abstractions
//!
//! - [`ProcessSupervisor`]: HOW units are started and stopped (systemd, custom)
//! - [`ReadinessProbe`]: WHEN a started unit can take traffic
//! - [`ModelSwitcher`]: serializes switches and hands out leases on the active unit
//!
//! ## Example
//!
//! ```ignore
//! use llm_switch::model_switcher::{HealthProber, ModelSwitcher, ModelSwitcherConfig, SystemdSupervisor};
//!
//! let supervisor = Arc::new(SystemdSupervisor::default());
//! let prober = Arc::new(HealthProber::new(Arc::new(create_hyper_client())));
//! let switcher = ModelSwitcher::new(registry, supervisor, prober, ModelSwitcherConfig::default());
//!
//! let lease = switcher.acquire("qwen3-coder").await?;
//! forwarder.forward(lease.state(), body).await?;
//! ```

mod health;
mod supervisor;
mod switcher;
mod systemd;

pub use health::{HealthProber, Readiness, ReadinessProbe};
pub use supervisor::{ProcessSupervisor, SupervisorError};
pub use switcher::{ActiveBackendState, BackendLease, ModelSwitcher, ModelSwitcherConfig};
pub use systemd::SystemdSupervisor;
