//! Bake scheduler
//!
//! `BakeSession` owns the immutable input and drives one bake at a time
//! through `Idle -> Preparing -> Baking -> Finishing | Cancelled -> Idle`.
//! The host calls [`BakeSession::tick`] once per frame; each tick processes
//! a bounded batch of triangles so the caller stays responsive.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{BakeSettings, BoneMasks, SphereMask};
use crate::error::{BakeError, Result};
use crate::flatten::{FlatMesh, MaterialTable, flatten};
use crate::masks::{NormalMapEntry, PreparedNormalMap};
use crate::occluder::Occluder;
use crate::postprocess::{MaterialTextures, finish};
use crate::raster::{DistanceEvaluator, MaterialBuffer, rasterize_triangle};
use crate::surface::{IslandSeed, Surface};

/// Share of the displayed progress range used by baking; postprocessing gets the rest.
const BAKE_PROGRESS_SHARE: f32 = 0.8;

/// Everything a bake reads. Never mutated by the session.
#[derive(Debug, Clone, Default)]
pub struct BakeInput {
    /// Surfaces to bake
    pub surfaces: Vec<Surface>,
    /// Surfaces used only as ray occluders
    pub occluders: Vec<Surface>,
    /// UV islands of `surfaces` (or `occluders`) added to the occluder
    pub island_seeds: Vec<IslandSeed>,
    pub spheres: Vec<SphereMask>,
    pub bone_masks: BoneMasks,
    pub normal_maps: Vec<NormalMapEntry>,
    pub settings: BakeSettings,
}

/// Scheduler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeState {
    /// No run in progress
    Idle,
    /// Flattening geometry and building the occluder
    Preparing,
    /// Rasterizing triangle batches
    Baking,
    /// Postprocessing material buffers
    Finishing,
    /// Run stopped, resources being released
    Cancelled,
}

/// Baked textures keyed by material name.
pub type BakeOutput = BTreeMap<String, MaterialTextures>;

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickStatus {
    /// More ticks are needed
    Continue,
    /// Run finished with one texture pair per baked material
    Completed(BakeOutput),
    /// Run stopped; no textures are produced
    Cancelled,
}

impl TickStatus {
    pub fn is_continue(&self) -> bool {
        matches!(self, TickStatus::Continue)
    }
}

/// Answer of a progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAction {
    Continue,
    Cancel,
}

/// Receives throttled progress updates.
pub trait ProgressSink {
    /// `progress` is in [0, 1]; `message` is a short human-readable status.
    fn report(&mut self, progress: f32, message: &str) -> ProgressAction;
}

impl<F> ProgressSink for F
where
    F: FnMut(f32, &str) -> ProgressAction,
{
    fn report(&mut self, progress: f32, message: &str) -> ProgressAction {
        self(progress, message)
    }
}

/// Sink that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _progress: f32, _message: &str) -> ProgressAction {
        ProgressAction::Continue
    }
}

/// Cloneable cancellation flag shared between the host and a session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation. Honored by the current run, or by the next one
    /// if no run is in progress.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Per-run state created by prepare and released exactly once.
struct BakeResources {
    mesh: FlatMesh,
    materials: MaterialTable,
    occluder: Option<Occluder>,
    /// Indexed by material id
    normal_maps: Vec<Option<PreparedNormalMap>>,
    /// Indexed by material id; `None` for materials that are not baked
    buffers: Vec<Option<MaterialBuffer>>,
    total_triangles: usize,
}

/// (submesh, triangle) position plus progress bookkeeping.
#[derive(Debug, Default)]
struct Cursor {
    submesh: usize,
    triangle: usize,
    processed: usize,
    last_reported: usize,
}

/// Cooperative bake driver
pub struct BakeSession {
    input: BakeInput,
    state: BakeState,
    resources: Option<BakeResources>,
    cursor: Cursor,
    batch_size: usize,
    cancel: CancelToken,
}

impl BakeSession {
    /// Validate settings and create an idle session.
    pub fn new(input: BakeInput) -> Result<Self> {
        input.settings.validate()?;
        let batch_size = input.settings.batch_size();
        Ok(Self {
            input,
            state: BakeState::Idle,
            resources: None,
            cursor: Cursor::default(),
            batch_size,
            cancel: CancelToken::default(),
        })
    }

    pub fn state(&self) -> BakeState {
        self.state
    }

    pub fn input(&self) -> &BakeInput {
        &self.input
    }

    /// Triangles processed per tick.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Token the host can use to cancel from anywhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether per-run resources (mesh, occluder, buffers) are alive.
    pub fn has_resources(&self) -> bool {
        self.resources.is_some()
    }

    /// Run the prepare phase and enter `Baking`.
    ///
    /// Only valid while idle. Faults and cancellation during prepare yield
    /// `Ok(TickStatus::Cancelled)`.
    pub fn start(&mut self) -> Result<TickStatus> {
        if self.state != BakeState::Idle {
            return Err(BakeError::InvalidState(self.state));
        }
        self.cursor = Cursor::default();
        self.transition(BakeState::Preparing);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            prepare(&self.input, &self.cancel)
        }));
        match outcome {
            Ok(Some(resources)) => {
                tracing::info!(
                    "Bake started: {} triangles, {} materials, {}x{} texels, batch {}",
                    resources.total_triangles,
                    resources.buffers.iter().flatten().count(),
                    self.input.settings.texture_size,
                    self.input.settings.texture_size,
                    self.batch_size
                );
                self.resources = Some(resources);
                self.transition(BakeState::Baking);
                Ok(TickStatus::Continue)
            }
            Ok(None) => {
                tracing::info!("Bake cancelled during prepare");
                Ok(self.cancel_run())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Bake prepare failed: {}", BakeError::Panicked(message));
                Ok(self.cancel_run())
            }
        }
    }

    /// Advance the run by one batch.
    ///
    /// Ticking an idle session starts a new run.
    pub fn tick(&mut self, sink: &mut dyn ProgressSink) -> TickStatus {
        match self.state {
            BakeState::Idle => match self.start() {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("{}", e);
                    TickStatus::Cancelled
                }
            },
            BakeState::Baking => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.bake_tick(sink)));
                match outcome {
                    Ok(status) => status,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("Bake tick failed: {}", BakeError::Panicked(message));
                        self.cancel_run()
                    }
                }
            }
            // Transient states only exist inside a tick.
            BakeState::Preparing | BakeState::Finishing | BakeState::Cancelled => {
                tracing::error!("{}", BakeError::InvalidState(self.state));
                self.cancel_run()
            }
        }
    }

    /// Tick until the run completes or is cancelled.
    pub fn run_to_end(&mut self, sink: &mut dyn ProgressSink) -> TickStatus {
        loop {
            let status = self.tick(sink);
            if !status.is_continue() {
                return status;
            }
        }
    }

    fn bake_tick(&mut self, sink: &mut dyn ProgressSink) -> TickStatus {
        let Some(resources) = self.resources.as_mut() else {
            return self.cancel_run();
        };
        bake_batch(&self.input, resources, &mut self.cursor, self.batch_size);

        let total = resources.total_triangles;
        let done = self.cursor.processed >= total;
        let mut cancel_requested = false;

        if should_report(self.cursor.processed, self.cursor.last_reported, total) {
            self.cursor.last_reported = self.cursor.processed;
            let progress = if total == 0 {
                BAKE_PROGRESS_SHARE
            } else {
                BAKE_PROGRESS_SHARE * self.cursor.processed as f32 / total as f32
            };
            let message = format!("{}/{}", self.cursor.processed, total);
            if sink.report(progress, &message) == ProgressAction::Cancel {
                cancel_requested = true;
            }
        }

        // Also the last check before completion.
        if cancel_requested || self.cancel.is_cancelled() {
            tracing::info!("Bake cancelled at {}/{} triangles", self.cursor.processed, total);
            return self.cancel_run();
        }
        if !done {
            return TickStatus::Continue;
        }
        self.finish_run(sink)
    }

    fn finish_run(&mut self, sink: &mut dyn ProgressSink) -> TickStatus {
        self.transition(BakeState::Finishing);
        let Some(mut resources) = self.resources.take() else {
            return self.cancel_run();
        };

        let settings = &self.input.settings;
        let baked = resources.buffers.iter().flatten().count();
        let mut output = BakeOutput::new();
        for (id, name) in resources.materials.iter() {
            let Some(buffer) = resources.buffers[id.index()].take() else {
                continue;
            };
            let share = (output.len() + 1) as f32 / baked as f32;
            let progress = BAKE_PROGRESS_SHARE + (1.0 - BAKE_PROGRESS_SHARE) * share;
            // Too late to cancel; the answer is ignored.
            let _ = sink.report(progress, &format!("Postprocessing {name}"));
            let textures = finish(name, buffer, settings.blur_radius, settings.padding);
            output.insert(name.to_string(), textures);
        }
        drop(resources);

        tracing::info!("Bake completed: {} materials", output.len());
        self.cancel.reset();
        self.transition(BakeState::Idle);
        TickStatus::Completed(output)
    }

    /// Release resources and return to idle. Safe to call from any state.
    fn cancel_run(&mut self) -> TickStatus {
        self.transition(BakeState::Cancelled);
        if let Some(resources) = self.resources.take() {
            tracing::debug!(
                "Released {} vertices, {} material buffers, occluder: {}",
                resources.mesh.vertex_count(),
                resources.buffers.iter().flatten().count(),
                resources.occluder.is_some()
            );
        }
        self.cancel.reset();
        self.transition(BakeState::Idle);
        TickStatus::Cancelled
    }

    fn transition(&mut self, next: BakeState) {
        if self.state != next {
            tracing::trace!("Bake state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Build per-run resources. `None` means cancellation was observed.
fn prepare(input: &BakeInput, cancel: &CancelToken) -> Option<BakeResources> {
    let settings = &input.settings;
    if cancel.is_cancelled() {
        return None;
    }

    let mut materials = MaterialTable::default();
    let mesh = flatten(&input.surfaces, &input.bone_masks, &mut materials);
    if cancel.is_cancelled() {
        return None;
    }

    let occluder = Occluder::build(&input.occluders, &input.island_seeds, &input.surfaces);
    match &occluder {
        Some(o) => tracing::debug!(
            "Occluder: {} vertices, {} triangles",
            o.vertex_count(),
            o.triangle_count()
        ),
        None => tracing::debug!("No occluder, occlusion disabled"),
    }
    if cancel.is_cancelled() {
        return None;
    }

    let mut normal_maps: Vec<Option<PreparedNormalMap>> = vec![None; materials.len()];
    for entry in &input.normal_maps {
        let Some(id) = materials.id(&entry.material) else {
            tracing::debug!("Normal map for unknown material '{}' ignored", entry.material);
            continue;
        };
        let prepared = PreparedNormalMap::prepare(entry, &mesh, id);
        if prepared.is_active() {
            normal_maps[id.index()] = Some(prepared);
        }
    }

    let buffers = materials
        .iter()
        .map(|(_, name)| {
            if settings.bakes_material(name) {
                Some(MaterialBuffer::new(settings.texture_size, settings.output_mode))
            } else {
                tracing::debug!("Material '{}' not selected, skipping", name);
                None
            }
        })
        .collect();

    let total_triangles = mesh.triangle_count();
    Some(BakeResources {
        mesh,
        materials,
        occluder,
        normal_maps,
        buffers,
        total_triangles,
    })
}

/// Rasterize up to `budget` triangles from the cursor.
fn bake_batch(
    input: &BakeInput,
    resources: &mut BakeResources,
    cursor: &mut Cursor,
    budget: usize,
) {
    let BakeResources {
        mesh,
        occluder,
        normal_maps,
        buffers,
        ..
    } = resources;
    let settings = &input.settings;
    let evaluator = DistanceEvaluator {
        spheres: &input.spheres,
        occluder: occluder.as_ref(),
        max_distance: settings.max_distance,
        ray_offset: settings.ray_offset,
        gamma: settings.gamma,
    };

    let mut remaining = budget;
    while remaining > 0 && cursor.submesh < mesh.submeshes.len() {
        let record = &mesh.submeshes[cursor.submesh];
        if cursor.triangle >= record.triangle_count() {
            cursor.submesh += 1;
            cursor.triangle = 0;
            continue;
        }
        let tri = record.triangle(cursor.triangle);
        cursor.triangle += 1;
        cursor.processed += 1;
        remaining -= 1;

        if !record.has_uvs {
            continue;
        }
        let material = record.material.index();
        let Some(buffer) = buffers[material].as_mut() else {
            continue;
        };
        rasterize_triangle(mesh, tri, normal_maps[material].as_ref(), &evaluator, buffer);
    }
}

/// Report on every 1% boundary crossing, every 1% of advance, and at the end.
fn should_report(processed: usize, last: usize, total: usize) -> bool {
    if processed >= total {
        return true;
    }
    let step = (total / 100).max(1);
    processed / step > last / step || processed - last >= step
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
