use std::fmt;

/// Where the bytes of a native tensor live.
///
/// Accelerator memory is addressed by ordinal. Host memory is a single space;
/// whether a host buffer is page-locked is tracked on the tensor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Host,
    /// Accelerator with device ordinal
    Accelerator(usize),
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }

    /// Accelerator ordinal, if applicable.
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            Device::Accelerator(idx) => Some(*idx),
            Device::Host => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "cpu"),
            Device::Accelerator(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Host.is_host());
        assert!(!Device::Host.is_accelerator());
        assert!(Device::Accelerator(0).is_accelerator());
        assert_eq!(Device::Accelerator(1).ordinal(), Some(1));
        assert_eq!(Device::Host.ordinal(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Host), "cpu");
        assert_eq!(format!("{}", Device::Accelerator(0)), "cuda:0");
    }
}
