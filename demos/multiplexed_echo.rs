//! Multiplexed echo: one TCP connection, several concurrent pipelines.
//!
//! Starts a server and a client in the same process. Each client thread
//! owns one pipeline and checks that it only ever reads its own replies.

use std::{sync::Arc, thread, time::Duration};

use millstream::{
    BlockingPipeline, Capabilities, ConnectConfig, EventLoop, Handler, MultiplexConfig,
    MultiplexedAdapter, MultiplexedConnection, Pipeline, PipelineHandler, ServerConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Echo;

impl PipelineHandler for Echo {
    fn on_pipeline_open(&self, pipeline: &Pipeline) {
        info!(pipeline = %pipeline.id(), "pipeline opened");
    }

    fn on_pipeline_data(&self, pipeline: &Pipeline) -> millstream::Result<bool> {
        let line = pipeline.read_by_delimiter(b"\n")?;
        pipeline.write(&line)?;
        pipeline.write(b"\n")?;
        Ok(true)
    }

    fn on_pipeline_close(&self, pipeline: &Pipeline) {
        info!(pipeline = %pipeline.id(), "pipeline closed");
    }
}

struct Detached;

impl Handler for Detached {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let event_loop = EventLoop::default();
    let server = event_loop.listen(
        ServerConfig::builder().address("127.0.0.1:0".parse()?).build(),
        Arc::new(MultiplexedAdapter::new(Arc::new(Echo))),
    )?;
    info!(addr = %server.local_addr(), "multiplexed echo server listening");

    let physical = event_loop.connect(server.local_addr(), ConnectConfig::default(), Arc::new(Detached))?;
    let mux = MultiplexedConnection::new(physical, MultiplexConfig::default(), None)?;

    let workers = (0..4)
        .map(|n| -> millstream::Result<_> {
            let mut pipeline = BlockingPipeline::new(mux.create_pipeline()?);
            pipeline.set_read_timeout(Duration::from_secs(5));
            Ok(thread::spawn(move || -> millstream::Result<()> {
                for i in 0..3 {
                    let message = format!("worker {} message {}\n", n, i);
                    pipeline.write(message.as_bytes())?;
                    let reply = pipeline.read_string_by_delimiter(b"\n")?;
                    info!(pipeline = %pipeline.id(), %reply, "echoed");
                }
                pipeline.close();
                Ok(())
            }))
        })
        .collect::<millstream::Result<Vec<_>>>()?;

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }

    mux.close();
    event_loop.stop();
    Ok(())
}
