pub mod executor;

pub use executor::ReqwestExecutor;
