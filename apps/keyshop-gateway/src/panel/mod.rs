mod client;

pub use client::{extend_expiry, ProvisionError, ProvisionResult, Provisioner, XuiClient, DAY_MS};
