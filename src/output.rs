use clap::ValueEnum;

/// How GSQL client output reaches the terminal.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Stream client output while the script runs.
    Stream,
    /// Print the client output as one block once the task finishes.
    #[default]
    Group,
}
