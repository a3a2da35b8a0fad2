//! Buffer and message size limits for IPC connections

/// Size of a frame header on the wire: message code then payload size
pub const FRAME_HEADER_SIZE: usize = 8;

/// Size of the read-ahead buffer attached to every connection
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Largest read-ahead buffer a configuration may ask for
pub const MAX_READ_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Share of the read buffer above which payload reads bypass it
pub const DEFAULT_BYPASS_PERCENT: u8 = 75;

/// Size limits applied to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcLimits {
    /// Capacity of the per-connection read-ahead buffer
    pub read_buffer_size: usize,
    /// Payload remainders of at least this percentage of the buffer
    /// capacity are read straight into the message
    pub bypass_percent: u8,
    /// Largest payload accepted from a peer; `None` trusts the size field
    pub max_message_size: Option<u32>,
}

impl IpcLimits {
    /// Payload remainder (in bytes) at which reads skip the internal buffer
    pub fn bypass_threshold(&self) -> usize {
        self.read_buffer_size
            .saturating_mul(usize::from(self.bypass_percent))
            / 100
    }

    pub fn accepts(&self, size: u32) -> bool {
        self.max_message_size.is_none_or(|max| size <= max)
    }
}

impl Default for IpcLimits {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            bypass_percent: DEFAULT_BYPASS_PERCENT,
            max_message_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_is_three_quarters() {
        let limits = IpcLimits::default();
        assert_eq!(limits.bypass_threshold(), 3072);
    }

    #[test]
    fn unbounded_by_default() {
        let limits = IpcLimits::default();
        assert!(limits.accepts(u32::MAX));
    }

    #[test]
    fn max_message_size_is_inclusive() {
        let limits = IpcLimits {
            max_message_size: Some(1024),
            ..Default::default()
        };
        assert!(limits.accepts(1024));
        assert!(!limits.accepts(1025));
    }

    #[test]
    fn threshold_saturates_on_huge_buffers() {
        let limits = IpcLimits {
            read_buffer_size: usize::MAX,
            ..Default::default()
        };
        assert_eq!(limits.bypass_threshold(), usize::MAX / 100);
    }
}
