pub mod chain;
pub mod error;
pub mod params;
pub mod stored;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
