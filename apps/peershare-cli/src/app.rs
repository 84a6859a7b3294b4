//! Wires a sending and a receiving peer together and runs one share.

use std::sync::Arc;

use peershare_data_channel::{STREAM_BUFFER_SIZE, dispatch, pair};
use peershare_transfer::{
    Device, DownloadDirectory, ShareReceiver, ShareUpload, Transfer, TransferRegistry,
    TransferState,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::args::Args;
use crate::config::AppConfig;

/// Name the receiving side announces.
const LOOPBACK_PEER: &str = "loopback";

/// Sends `args.files` to an in-process peer that saves them under
/// `config.download_dir`, then prints one summary line per batch.
pub async fn run(config: AppConfig, args: Args) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    let (local, remote) = pair(&config.device_name, LOOPBACK_PEER, STREAM_BUFFER_SIZE);

    // -- Receiving side --
    let registry = Arc::new(TransferRegistry::default());
    registry.on_progress(Box::new(|p| {
        debug!(
            batch = %p.id,
            file = p.current_file.as_deref().unwrap_or("-"),
            files = p.completed_files,
            of = p.total_files,
            percent = p.percentage(),
            "receiving"
        );
    }));
    registry.start();

    let receiving: Arc<dyn Device> = remote.device.clone();
    let receiver = Arc::new(ShareReceiver::new(
        &receiving,
        Arc::new(DownloadDirectory::new(&config.download_dir)),
        config.transfer.clone(),
        Arc::clone(&registry),
    ));
    let dispatcher = {
        let receiver = Arc::clone(&receiver);
        let inbox = remote.inbox;
        tokio::spawn(async move { dispatch(inbox, &receiver).await })
    };
    let shutdown = {
        let receiver = Arc::clone(&receiver);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            receiver.shutdown();
        })
    };

    // -- Sending side --
    let sending: Arc<dyn Device> = local.device.clone();
    let upload = ShareUpload::new(&sending, config.transfer.clone()).with_open(args.open);
    let admission = upload.add_files(args.files);

    let upload_result = upload.execute(cancel.clone()).await;
    match admission.await {
        Ok(Err(e)) => warn!(error = %e, "files were not admitted"),
        Err(e) => warn!(error = %e, "admission task failed"),
        Ok(Ok(_)) => {}
    }
    let sent = upload.batch().report();
    println!("{sent}");

    // Dropping the sending device closes the peer's inbox.
    drop(upload);
    drop(sending);
    drop(local);

    let downloads = dispatcher.await?;
    let mut received_ok = true;
    for download in &downloads {
        let state = download.batch().wait_finished().await;
        received_ok &= state == TransferState::Complete;
        println!("{}", download.batch().report());
    }

    shutdown.abort();
    registry.stop();

    match upload_result {
        Ok(()) if received_ok => {
            info!(files = sent.completed_files, "share complete");
            Ok(())
        }
        Ok(()) => anyhow::bail!("receiving side did not complete"),
        Err(e) => Err(e.into()),
    }
}
