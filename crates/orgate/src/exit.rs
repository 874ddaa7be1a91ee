//! Detect a "ctrl-c" notification or other reason to exit.

use anyhow::Result;

/// Wait until a control-c notification is received.
///
/// See the documentation for `tokio::signal::ctrl_c` for caveats about
/// what happens to the default signal disposition once this has been
/// called.
pub(crate) async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
