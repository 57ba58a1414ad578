/// Notifications from the session worker, in the order things happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PortOpened(bool),
    PortClosed,
    AdapterInitialised(bool),
    /// `false` both for a failed open and for a channel that went away.
    ChannelOpened(bool),
    /// Diagnostic session started, with the session parameter echoed back.
    DiagStarted(u8),
    BlockOpened(u8),
    BlockClosed(u8),
    NewBlockData(u8),
    /// Short identification strings.
    NewEcuInfo(Vec<String>),
    /// Part number and component name.
    NewModuleInfo(Vec<String>),
    LabelsLoaded(bool),
    ModuleListRefreshed,
    /// Sample slots were rebuilt; column layout may differ.
    SampleFormatChanged,
    LoggingStarted,
    /// The module answered a request with a negative response (`7F`).
    RequestRejected { service: u8, reason: Option<u8> },
}
