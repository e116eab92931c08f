pub mod config;
pub mod model;
pub mod tracing;
pub mod wire;

#[cfg(test)]
test_r::enable!();

/// Rendering of errors that is safe to return to RPC callers. The blanket
/// `Display` of an error may embed internal details (paths, raw causes);
/// `to_safe_string` is what crosses the server boundary.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}
