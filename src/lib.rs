pub mod cluster;
pub mod config;
pub mod de_engine;
pub mod enrichment;
pub mod error;
pub mod files;
pub mod gene_symbols;
pub mod genomic_tools;
pub mod logging;
pub mod matrix;
pub mod result_cache;
pub mod results;
pub mod transform;
pub mod validator;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;

pub use exprlab_protocol as protocol;
