//! Out-of-band query cancellation.
use crate::{
    Result,
    config::Config,
    postgres::frontend::CancelRequest,
    transport::PgStream,
};

/// Open a dedicated short-lived connection to the same address and ask
/// the server to abandon the target backend's current query.
///
/// The primary connection of the session is never touched; the server
/// closes this one itself, there is no response to read.
pub(crate) async fn cancel_request(
    config: &Config,
    process_id: i32,
    secret_key: i32,
) -> Result<()> {
    let mut io = PgStream::connect(config).await?;
    io.send_cancel(CancelRequest { process_id, secret_key });
    io.flush().await?;
    Ok(())
}
