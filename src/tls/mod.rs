pub mod ca;
pub mod cache;
pub mod factory;
pub mod janitor;
pub mod resolver;

pub use ca::{CaIdentity, generate_ca, init_ca_files};
pub use cache::{CertCache, CertEntry};
pub use factory::{CertificateFactory, LeafPolicy};
pub use janitor::Janitor;
pub use resolver::{CertResolver, server_config};
