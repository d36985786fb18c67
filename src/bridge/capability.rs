/// A host-dependent capability: either usable, or disabled with the reason
/// it could not be established.
///
/// Consumers match on this once instead of checking a global "bridge ready"
/// flag at every call site.
#[derive(Debug, Clone)]
pub enum Capability<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Capability<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            Self::Available(inner) => Some(inner),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn available_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Available(inner) => Some(inner),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Available(_) => None,
            Self::Unavailable { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_keeps_its_reason() {
        let mut disabled: Capability<u8> = Capability::unavailable("no host");
        assert!(!disabled.is_available());
        assert!(disabled.available_mut().is_none());
        assert_eq!(disabled.reason(), Some("no host"));

        let mut enabled = Capability::Available(2u8);
        if let Some(value) = enabled.available_mut() {
            *value *= 2;
        }
        assert_eq!(enabled.available(), Some(&4));
        assert_eq!(enabled.reason(), None);
    }
}
