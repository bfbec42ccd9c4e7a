use num::{FromPrimitive, traits::WrappingAdd};
use std::env;

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Get the connection timeout in milliseconds, either from environment or default 3000
pub fn get_default_connect_timeout_ms() -> u64 {
    env::var("NETSHRVAR_CONNECT_TMO_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(3000)
}

/// Get the synchronous write timeout in milliseconds, either from environment or default 5000
pub fn get_default_write_timeout_ms() -> u64 {
    env::var("NETSHRVAR_WRITE_TMO_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5000)
}

/// Get the client side buffer size for buffered connections, default 200 items
pub fn get_default_client_buffer_items() -> usize {
    env::var("NETSHRVAR_CLIENT_BUFFER_ITEMS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(200)
        .max(1)
}
