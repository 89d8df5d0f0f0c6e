//! The flow engine
//!
//! Owns the live-source registry and the flow registry, runs the
//! capture thread and the processing loop, and applies control-plane
//! commands atomically with respect to both. Lock order, whenever both
//! registries are involved: sources first, then flows.

use crate::flow::{ClientAddr, Flow};
use crate::publish::{paths, Publisher};
use crate::registry::{DetectorFactory, SourceFactory};
use blobserver_core::config::FlowConfig;
use blobserver_core::shm::ShmWriter;
use blobserver_core::{Error, Frame, Result, Value, REPLY_PORT, SHM_PREFIX};
use blobserver_vision::{SourceHandle, SourceRegistry};
use image::GrayImage;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Capture thread polling period.
const CAPTURE_PERIOD: Duration = Duration::from_millis(1);

/// Processing loop cadence.
const FRAME_PERIOD: Duration = Duration::from_millis(16);

pub struct FlowEngine {
    sources: Arc<SourceRegistry>,
    flows: Mutex<Vec<Flow>>,
    detector_factory: DetectorFactory,
    source_factory: SourceFactory,
    publisher: Arc<dyn Publisher>,
    global_mask: Option<GrayImage>,
    shm_dir: PathBuf,
    next_flow_id: AtomicU32,
    frame_nbr: AtomicU64,
    running: AtomicBool,
}

impl FlowEngine {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            sources: Arc::new(SourceRegistry::new()),
            flows: Mutex::new(Vec::new()),
            detector_factory: DetectorFactory::with_builtin_kinds(),
            source_factory: SourceFactory::with_builtin_kinds(),
            publisher,
            global_mask: None,
            shm_dir: PathBuf::from("/tmp"),
            next_flow_id: AtomicU32::new(1),
            frame_nbr: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    /// Directory output segments are created in.
    pub fn with_shm_dir(mut self, dir: PathBuf) -> Self {
        self.shm_dir = dir;
        self
    }

    /// Greyscale mask bound to every detector at flow creation.
    pub fn with_mask(mut self, mask: GrayImage) -> Self {
        self.global_mask = Some(mask);
        self
    }

    pub fn source_registry(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn frame_nbr(&self) -> u64 {
        self.frame_nbr.load(Ordering::Relaxed)
    }

    fn release_specs(&self, specs: &[(String, i32)]) {
        for (kind, subsource) in specs {
            self.sources.release(kind, *subsource);
        }
    }

    /// Create a flow: validate, acquire (or register) the source
    /// tuple, build the detector and the output segment, and insert
    /// the flow paused. Any failure rolls the acquisitions back and
    /// leaves the engine untouched.
    pub fn connect(
        &self,
        client: ClientAddr,
        detector_kind: &str,
        source_specs: &[(String, i32)],
    ) -> Result<u32> {
        let mut detector = self.detector_factory.create(detector_kind)?;
        if source_specs.is_empty() {
            return Err(Error::Validation("No source specified".to_string()));
        }
        if source_specs.len() < detector.required_source_count() {
            return Err(Error::Validation(
                "The specified detector needs more sources".to_string(),
            ));
        }

        // Referrers taken here stand for the flow until it is
        // inserted, which keeps the capture thread from reclaiming a
        // source mid-construction.
        let mut sources = Vec::with_capacity(source_specs.len());
        let mut acquired: Vec<(String, i32)> = Vec::new();
        for (kind, subsource) in source_specs {
            let source = match self.sources.acquire_existing(kind, *subsource) {
                Some(source) => source,
                None => {
                    let connected = self.source_factory.create(kind, *subsource).and_then(
                        |source| {
                            if source.lock().connect() {
                                Ok(source)
                            } else {
                                Err(Error::Resource(format!(
                                    "Unable to connect to source {}",
                                    kind
                                )))
                            }
                        },
                    );
                    match connected {
                        Ok(source) => {
                            self.sources.insert(Arc::clone(&source));
                            source
                        }
                        Err(e) => {
                            self.release_specs(&acquired);
                            return Err(e);
                        }
                    }
                }
            };
            acquired.push((kind.clone(), *subsource));
            sources.push(source);
        }

        let id = self.next_flow_id.fetch_add(1, Ordering::SeqCst);
        let (width, height) = {
            let first = sources[0].lock();
            let width = first
                .get_parameter("width")
                .ok()
                .and_then(|v| v.as_i32())
                .unwrap_or(640);
            let height = first
                .get_parameter("height")
                .ok()
                .and_then(|v| v.as_i32())
                .unwrap_or(480);
            (width.max(1) as u32, height.max(1) as u32)
        };
        let shm_path = self.shm_dir.join(format!("{}_{}", SHM_PREFIX, id));
        let shm = match ShmWriter::create(&shm_path, width, height) {
            Ok(shm) => shm,
            Err(e) => {
                self.release_specs(&acquired);
                return Err(Error::Resource(e.to_string()));
            }
        };

        if let Some(mask) = &self.global_mask {
            detector.set_mask(mask.clone());
        }
        for (kind, subsource) in &acquired {
            detector.add_source(SourceHandle::new(&self.sources, kind, *subsource));
        }

        info!(client = %client, detector = detector_kind, id, "Flow created");
        self.flows.lock().push(Flow {
            id,
            sources,
            source_ids: acquired,
            detector,
            client,
            run: false,
            shm,
        });
        Ok(id)
    }

    /// Remove every flow subscribed from `client_host` (narrowed to
    /// one flow when an id is given), notify the subscribers, and drop
    /// the source referrers. Reclamation happens on the next capture
    /// tick. Removing nothing is a no-op.
    pub fn disconnect(&self, client_host: &str, flow_id: Option<u32>) -> Vec<u32> {
        let removed: Vec<Flow> = {
            let mut flows = self.flows.lock();
            let mut kept = Vec::with_capacity(flows.len());
            let mut removed = Vec::new();
            for flow in flows.drain(..) {
                let matches =
                    flow.client.host == client_host && flow_id.map_or(true, |id| id == flow.id);
                if matches {
                    removed.push(flow);
                } else {
                    kept.push(flow);
                }
            }
            *flows = kept;
            removed
        };

        let reply_to = ClientAddr::new(client_host, REPLY_PORT);
        let mut ids = Vec::with_capacity(removed.len());
        for flow in removed {
            for (kind, subsource) in &flow.source_ids {
                self.sources.release(kind, *subsource);
            }
            self.publisher.send(
                &reply_to,
                paths::DISCONNECT,
                vec![Value::Str("Disconnected".to_string())],
            );
            info!(client = client_host, id = flow.id, "Flow closed");
            ids.push(flow.id);
        }
        ids
    }

    pub fn set_parameter(&self, flow_id: u32, target: &str, args: &[Value]) -> Result<()> {
        let mut flows = self.flows.lock();
        let flow = flows
            .iter_mut()
            .find(|f| f.id == flow_id)
            .ok_or_else(|| Error::Validation(format!("No flow with id {}", flow_id)))?;
        match target {
            "Start" => {
                flow.run = true;
                info!(id = flow.id, "Flow started");
                Ok(())
            }
            "Stop" => {
                flow.run = false;
                info!(id = flow.id, "Flow stopped");
                Ok(())
            }
            "Detector" => {
                if args.len() < 2 {
                    return Err(Error::Validation("Wrong number of arguments".to_string()));
                }
                let name = args[0]
                    .as_str()
                    .ok_or_else(|| Error::Validation("Expected a parameter name".to_string()))?;
                flow.detector
                    .set_parameter(name, args[1].clone())
                    .map_err(Into::into)
            }
            "Source" | "Sources" => {
                if args.len() < 3 {
                    return Err(Error::Validation("Wrong number of arguments".to_string()));
                }
                let index = args[0]
                    .as_i32()
                    .ok_or_else(|| Error::Validation("Expected a source index".to_string()))?;
                if index < 0 || index as usize >= flow.sources.len() {
                    return Err(Error::Validation("Wrong source index".to_string()));
                }
                let name = args[1]
                    .as_str()
                    .ok_or_else(|| Error::Validation("Expected a parameter name".to_string()))?;
                flow.sources[index as usize]
                    .lock()
                    .set_parameter(name, args[2].clone())
                    .map_err(Into::into)
            }
            other => Err(Error::Validation(format!("Unknown target {}", other))),
        }
    }

    pub fn get_parameter(
        &self,
        flow_id: u32,
        target: &str,
        name: &str,
        source_index: Option<i32>,
    ) -> Result<Value> {
        let flows = self.flows.lock();
        let flow = flows
            .iter()
            .find(|f| f.id == flow_id)
            .ok_or_else(|| Error::Validation(format!("No flow with id {}", flow_id)))?;
        match target {
            "Detector" => flow.detector.get_parameter(name).map_err(Into::into),
            "Source" | "Sources" => {
                let index = source_index
                    .ok_or_else(|| Error::Validation("Wrong number of arguments".to_string()))?;
                if index < 0 || index as usize >= flow.sources.len() {
                    return Err(Error::Validation("Wrong source index".to_string()));
                }
                flow.sources[index as usize]
                    .lock()
                    .get_parameter(name)
                    .map_err(Into::into)
            }
            other => Err(Error::Validation(format!("Unknown target {}", other))),
        }
    }

    pub fn list_detectors(&self) -> Vec<String> {
        self.detector_factory.list()
    }

    pub fn list_sources(&self) -> Vec<String> {
        self.source_factory.list()
    }

    pub fn list_subsources(&self, kind: &str) -> Result<Vec<i32>> {
        self.source_factory.subsources(kind)
    }

    /// One pass of the processing loop: a synchronizing retrieve over
    /// every registered source, then dispatch to every running flow
    /// with its blob report wrapped in the start/end frame envelope.
    pub fn process_frame(&self) {
        let frame_nbr = self.frame_nbr.fetch_add(1, Ordering::SeqCst) + 1;

        // Sources cannot vanish while flows read them below: each flow
        // holds strong references, and reclamation only runs on
        // entries without referrers.
        self.sources.retrieve_all();

        let mut flows = self.flows.lock();
        for flow in flows.iter_mut().filter(|f| f.run) {
            let frames: Vec<Frame> = flow
                .sources
                .iter()
                .map(|source| source.lock().retrieve_corrected())
                .collect();
            let report = flow.detector.detect(&frames);

            let output = flow.detector.output_image();
            if output.width() > 0 && output.height() > 0 {
                if let Err(e) = flow.shm.write(&output) {
                    warn!(id = flow.id, "Output publish failed: {}", e);
                }
            }

            let envelope = vec![Value::Int(frame_nbr as i32), Value::Int(flow.id as i32)];
            self.publisher
                .send(&flow.client, paths::START_FRAME, envelope.clone());
            for index in 0..report.blob_count() {
                self.publisher
                    .send(&flow.client, flow.detector.osc_path(), report.blob(index).to_vec());
            }
            self.publisher
                .send(&flow.client, paths::END_FRAME, envelope);
        }
    }

    /// Spawn the ~1 kHz capture thread: grab every source, then
    /// reclaim the unreferenced ones.
    pub fn start_capture_thread(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let engine = Arc::clone(self);
        thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                while engine.running.load(Ordering::Relaxed) {
                    engine.sources.grab_all_and_reclaim();
                    thread::sleep(CAPTURE_PERIOD);
                }
            })
    }

    /// The processing loop, at frame cadence. Returns once
    /// [`FlowEngine::shutdown`] is called.
    pub fn run_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.process_frame();
            let elapsed = started.elapsed();
            if elapsed < FRAME_PERIOD {
                thread::sleep(FRAME_PERIOD - elapsed);
            }
        }
    }

    /// Ask both loops to drain their current iteration and stop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Create (and optionally start) the flows a configuration file
    /// declares, through the same command path the control plane uses.
    /// A failing flow is reported and skipped; the rest still come up.
    pub fn apply_startup_flows(&self, flows: &[FlowConfig]) {
        for config in flows {
            let client = ClientAddr::new(config.client.clone(), config.port);
            let specs: Vec<(String, i32)> = config
                .sources
                .iter()
                .map(|s| (s.kind.clone(), s.subsource))
                .collect();
            match self.connect(client, &config.detector, &specs) {
                Ok(id) => {
                    if config.start {
                        // The flow was just created; Start cannot fail.
                        let _ = self.set_parameter(id, "Start", &[]);
                    }
                }
                Err(e) => warn!(
                    detector = %config.detector,
                    "Startup flow skipped: {}", e
                ),
            }
        }
    }
}
