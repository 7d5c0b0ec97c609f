use std::path::PathBuf;

/// What happens during an install or uninstall run, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallEvent {
    StepStarted(&'static str),
    StepFinished(&'static str),
    /// Unpacking progress between 0.0 and 1.0.
    Progress(f32),
    Done(InstallReport),
}

/// Summary of a finished install.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallReport {
    pub install_dir: PathBuf,
    pub uninstall_key: String,
    pub shortcut: PathBuf,
    pub context_menu_entries: usize,
    pub installed_bytes: u64,
}

/// Receives [`InstallEvent`]s, e.g. to drive a progress bar.
pub trait InstallObserver {
    fn on_event(&mut self, event: InstallEvent);
}

impl<F: FnMut(InstallEvent)> InstallObserver for F {
    fn on_event(&mut self, event: InstallEvent) {
        self(event)
    }
}

/// Ignores every event.
pub struct Silent;

impl InstallObserver for Silent {
    fn on_event(&mut self, _event: InstallEvent) {}
}
