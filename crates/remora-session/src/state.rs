//! Controller lifecycle states.

/// Where the controller's model session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerState {
    /// No model known.
    #[default]
    Empty,
    /// A load or upload is in progress.
    Provisioning,
    /// Model bytes and info are known but there is no live session, e.g. after
    /// restoring from a project file or after the server target changed.
    Read,
    /// Session is live.
    Ready,
    /// The last load or upload failed.
    Error,
}

impl ControllerState {
    /// Whether a new load or upload may start. Only one runs at a time.
    pub fn accepts_load(&self) -> bool {
        !matches!(self, ControllerState::Provisioning)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Ready | ControllerState::Error)
    }

    /// Whether model info is available to read.
    pub fn has_model_info(&self) -> bool {
        matches!(self, ControllerState::Ready | ControllerState::Read)
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Empty => write!(f, "empty"),
            ControllerState::Provisioning => write!(f, "provisioning"),
            ControllerState::Read => write!(f, "read"),
            ControllerState::Ready => write!(f, "ready"),
            ControllerState::Error => write!(f, "error"),
        }
    }
}

/// State implied by which slots are filled.
///
/// Info, binary and session together mean `Ready`; info and binary without a
/// session mean `Read`; anything else is `Empty`. `Provisioning` and `Error`
/// are never derived, only entered by load operations.
pub fn derive_state(has_info: bool, has_binary: bool, has_session: bool) -> ControllerState {
    match (has_info, has_binary, has_session) {
        (true, true, true) => ControllerState::Ready,
        (true, true, false) => ControllerState::Read,
        _ => ControllerState::Empty,
    }
}
