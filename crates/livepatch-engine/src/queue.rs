//! The injection queue
//!
//! All patch work is serialized through one queue, which is what lets the
//! registries and slot writes go without per-write locking. The queue either
//! owns the engine on a dedicated thread ([`QueueMode::Background`]) or holds
//! it until the host pumps the queue from its own run loop
//! ([`QueueMode::Main`]).

use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::QueueMode;
use crate::defaults::INJECTION_THREAD_NAME;
use crate::engine::{PatchEngine, PatchReport};
use crate::error::PatchError;

/// Reply channel for one submitted load
pub type PatchReply = Receiver<Result<PatchReport, PatchError>>;

struct LoadRequest {
    path: PathBuf,
    reply: Sender<Result<PatchReport, PatchError>>,
}

enum Worker {
    Background(JoinHandle<PatchEngine>),
    Main {
        engine: PatchEngine,
        requests: Receiver<LoadRequest>,
    },
}

/// Serializes module loads onto a single context
pub struct InjectionQueue {
    sender: Option<Sender<LoadRequest>>,
    worker: Option<Worker>,
}

impl InjectionQueue {
    /// Start a queue in the mode the engine's configuration asks for
    pub fn start(engine: PatchEngine) -> Result<Self, PatchError> {
        match engine.config().queue {
            QueueMode::Background => Self::background(engine),
            QueueMode::Main => Ok(Self::main(engine)),
        }
    }

    /// Move the engine onto a dedicated injection thread
    pub fn background(mut engine: PatchEngine) -> Result<Self, PatchError> {
        let (sender, requests) = unbounded::<LoadRequest>();
        let handle = std::thread::Builder::new()
            .name(INJECTION_THREAD_NAME.to_string())
            .spawn(move || {
                for request in requests {
                    process(&mut engine, request);
                }
                debug!("Injection queue drained");
                engine
            })
            .map_err(PatchError::Spawn)?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(Worker::Background(handle)),
        })
    }

    /// Keep the engine until the host calls [`InjectionQueue::pump`]
    pub fn main(engine: PatchEngine) -> Self {
        let (sender, requests) = unbounded();
        Self {
            sender: Some(sender),
            worker: Some(Worker::Main { engine, requests }),
        }
    }

    /// Queue a load. The returned channel yields its report once processed.
    pub fn submit(&self, path: impl Into<PathBuf>) -> Result<PatchReply, PatchError> {
        let sender = self.sender.as_ref().ok_or(PatchError::QueueClosed)?;
        let (reply, receiver) = bounded(1);
        sender
            .send(LoadRequest {
                path: path.into(),
                reply,
            })
            .map_err(|_| PatchError::QueueClosed)?;
        Ok(receiver)
    }

    /// Process pending loads on the calling thread. Only does work in main
    /// mode; returns how many loads ran.
    pub fn pump(&mut self) -> usize {
        let Some(Worker::Main { engine, requests }) = self.worker.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(request) = requests.try_recv() {
            process(engine, request);
            count += 1;
        }
        count
    }

    /// Stop accepting loads, finish the queued ones and hand the engine
    /// back. Returns `None` if the injection thread panicked.
    pub fn shutdown(mut self) -> Option<PatchEngine> {
        self.sender = None;
        match self.worker.take()? {
            Worker::Background(handle) => match handle.join() {
                Ok(engine) => Some(engine),
                Err(_) => {
                    warn!("Injection thread panicked");
                    None
                }
            },
            Worker::Main {
                mut engine,
                requests,
            } => {
                for request in requests.try_iter() {
                    process(&mut engine, request);
                }
                Some(engine)
            }
        }
    }
}

impl Drop for InjectionQueue {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(Worker::Background(handle)) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn process(engine: &mut PatchEngine, request: LoadRequest) {
    let result = engine.load(&request.path);
    if let Err(error) = &result {
        warn!(path = %request.path.display(), %error, "Load failed");
    }
    // The submitter may have stopped waiting for the reply.
    let _ = request.reply.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatchConfig;
    use crate::image::{ClassBuilder, MemoryImage, ModuleBuilder, Value};
    use std::sync::Arc;

    fn staged_image() -> MemoryImage {
        let image = MemoryImage::new();
        for version in ["v1", "v2"] {
            image.stage(
                format!("/tmp/{}.so", version),
                ModuleBuilder::new(version)
                    .method("X.f", move |_| Value::from(version))
                    .class(ClassBuilder::new("X").slot("f", "X.f")),
            );
        }
        image
    }

    #[test]
    fn test_background_queue() {
        let image = staged_image();
        let engine = PatchEngine::new(Arc::new(image.clone()), PatchConfig::default());
        let queue = InjectionQueue::start(engine).unwrap();

        let first = queue.submit("/tmp/v1.so").unwrap();
        let second = queue.submit("/tmp/v2.so").unwrap();
        assert_eq!(first.recv().unwrap().unwrap().sequence, 1);
        let report = second.recv().unwrap().unwrap();
        assert_eq!(report.classes_patched, 1);

        let missing = queue.submit("/tmp/v3.so").unwrap();
        assert!(matches!(
            missing.recv().unwrap(),
            Err(PatchError::ModuleNotFound(_))
        ));

        let engine = queue.shutdown().unwrap();
        assert_eq!(engine.interposition().len(), 1);
    }

    #[test]
    fn test_main_queue_waits_for_pump() {
        let image = staged_image();
        let config = PatchConfig {
            queue: QueueMode::Main,
            ..PatchConfig::default()
        };
        let engine = PatchEngine::new(Arc::new(image.clone()), config);
        let mut queue = InjectionQueue::start(engine).unwrap();

        let reply = queue.submit("/tmp/v1.so").unwrap();
        assert!(reply.try_recv().is_err());
        assert_eq!(queue.pump(), 1);
        assert!(reply.try_recv().unwrap().is_ok());

        let pending = queue.submit("/tmp/v2.so").unwrap();
        let engine = queue.shutdown().unwrap();
        assert!(pending.recv().unwrap().is_ok());
        assert_eq!(engine.image().modules().len(), 2);
    }
}
