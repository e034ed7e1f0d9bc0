pub mod formula;
pub mod results;
pub mod scp;
pub mod service;

pub use formula::{formula_pack, formula_run};
pub use results::results_report;
pub use scp::scp;
pub use service::service;
