//! Blob identity tracking
//!
//! Detectors extract raw blob measurements frame by frame; this module
//! turns them into blobs with stable identities. Each tracked blob
//! carries a constant-velocity motion filter; assignment between the
//! filter predictions and the new measurements is greedy on squared
//! distance, nearest pair first.

use tracing::trace;

/// One blob measurement for the current frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobProperties {
    /// Pixel position.
    pub x: i32,
    pub y: i32,
    /// Velocity in pixels per frame.
    pub vx: f32,
    pub vy: f32,
    /// Dominant colour, RGB.
    pub color: [u8; 3],
    /// Principal-axis angle in radians.
    pub orientation: f32,
    /// Area in pixels.
    pub size: f32,
}

impl BlobProperties {
    pub fn at(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            color: [0, 0, 0],
            orientation: 0.0,
            size: 0.0,
        }
    }
}

/// Constant-velocity filter over `[x, y, vx, vy]` with diagonal
/// covariance. Position is the only measured quantity; velocity is
/// estimated from the innovation.
#[derive(Debug, Clone)]
struct MotionFilter {
    state: [f32; 4],
    p: [f32; 4],
    q: f32,
    r: f32,
}

impl MotionFilter {
    fn new(x: f32, y: f32, q: f32, r: f32) -> Self {
        Self {
            state: [x, y, 0.0, 0.0],
            p: [10.0; 4],
            q,
            r,
        }
    }

    fn predict(&mut self) -> (f32, f32) {
        self.state[0] += self.state[2];
        self.state[1] += self.state[3];
        for p in &mut self.p {
            *p += self.q;
        }
        (self.state[0], self.state[1])
    }

    fn update(&mut self, mx: f32, my: f32) {
        let residual = [mx - self.state[0], my - self.state[1]];
        let k = [
            self.p[0] / (self.p[0] + self.r),
            self.p[1] / (self.p[1] + self.r),
            // Velocity converges slower than position.
            self.p[2] / (self.p[2] + self.r * 10.0),
            self.p[3] / (self.p[3] + self.r * 10.0),
        ];
        self.state[0] += k[0] * residual[0];
        self.state[1] += k[1] * residual[1];
        self.state[2] += k[2] * residual[0];
        self.state[3] += k[3] * residual[1];
        for (p, k) in self.p.iter_mut().zip(k) {
            *p *= 1.0 - k;
        }
    }

    fn position(&self) -> (f32, f32) {
        (self.state[0], self.state[1])
    }

    fn velocity(&self) -> (f32, f32) {
        (self.state[2], self.state[3])
    }
}

/// A blob with a stable identity across frames.
#[derive(Debug, Clone)]
pub struct TrackedBlob {
    id: u64,
    properties: BlobProperties,
    filter: MotionFilter,
    predicted: (f32, f32),
    lifetime: i32,
    updated: bool,
}

impl TrackedBlob {
    fn new(id: u64, measure: &BlobProperties, lifetime: i32, q: f32, r: f32) -> Self {
        Self {
            id,
            properties: *measure,
            filter: MotionFilter::new(measure.x as f32, measure.y as f32, q, r),
            predicted: (measure.x as f32, measure.y as f32),
            lifetime,
            updated: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn properties(&self) -> &BlobProperties {
        &self.properties
    }

    /// Whether a measurement was assigned to this blob on the current
    /// frame.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn lifetime(&self) -> i32 {
        self.lifetime
    }

    fn predict(&mut self) {
        self.predicted = self.filter.predict();
        self.updated = false;
    }

    /// Squared distance between the filter prediction and a
    /// measurement.
    fn distance_from_prediction(&self, measure: &BlobProperties) -> f32 {
        let dx = self.predicted.0 - measure.x as f32;
        let dy = self.predicted.1 - measure.y as f32;
        dx * dx + dy * dy
    }

    fn set_measures(&mut self, measure: &BlobProperties) {
        self.filter.update(measure.x as f32, measure.y as f32);
        self.properties = *measure;
        let (vx, vy) = self.filter.velocity();
        self.properties.vx = vx;
        self.properties.vy = vy;
        self.updated = true;
    }

    /// Filter position, useful for visualization between measurements.
    pub fn position(&self) -> (f32, f32) {
        self.filter.position()
    }
}

/// Per-detector tracking state: the alive blobs plus the identity
/// counter. IDs are monotonic and never reused within the detector's
/// lifetime.
#[derive(Debug)]
pub struct BlobTracker {
    blobs: Vec<TrackedBlob>,
    next_id: u64,
    pub lifetime: i32,
    pub process_noise: f32,
    pub measurement_noise: f32,
}

impl BlobTracker {
    pub fn new(lifetime: i32) -> Self {
        Self {
            blobs: Vec::new(),
            next_id: 1,
            lifetime,
            process_noise: 0.1,
            measurement_noise: 4.0,
        }
    }

    pub fn blobs(&self) -> &[TrackedBlob] {
        &self.blobs
    }

    /// Feed one frame of measurements through the tracker.
    ///
    /// Assignment is one-to-one: at most one measurement per blob and
    /// one blob per measurement. Ties on distance go to the earliest
    /// candidate pair in generation order (measurement-major), which
    /// keeps the outcome deterministic for a deterministic input order.
    pub fn update(&mut self, measures: &[BlobProperties]) {
        for blob in &mut self.blobs {
            blob.predict();
        }

        // Candidate pairs between every prediction and every
        // measurement, in generation order.
        #[derive(Clone, Copy)]
        struct Pair {
            blob_idx: usize,
            measure_idx: usize,
            dist: f32,
        }
        let mut pairs = Vec::with_capacity(self.blobs.len() * measures.len());
        for (measure_idx, measure) in measures.iter().enumerate() {
            for (blob_idx, blob) in self.blobs.iter().enumerate() {
                pairs.push(Pair {
                    blob_idx,
                    measure_idx,
                    dist: blob.distance_from_prediction(measure),
                });
            }
        }

        // Greedy nearest-pair assignment. Every accepted pair retires
        // all other pairs sharing its blob or its measurement.
        let mut assigned: Vec<(usize, usize)> = Vec::new();
        while !pairs.is_empty() {
            let mut best = 0;
            for (idx, pair) in pairs.iter().enumerate() {
                if pair.dist < pairs[best].dist {
                    best = idx;
                }
            }
            let nearest = pairs[best];
            assigned.push((nearest.blob_idx, nearest.measure_idx));
            pairs.retain(|p| {
                p.blob_idx != nearest.blob_idx && p.measure_idx != nearest.measure_idx
            });
        }

        for &(blob_idx, measure_idx) in &assigned {
            let blob = &mut self.blobs[blob_idx];
            blob.set_measures(&measures[measure_idx]);
            blob.lifetime = self.lifetime;
        }

        // Unassigned blobs age; below zero they are gone.
        for (blob_idx, blob) in self.blobs.iter_mut().enumerate() {
            if !assigned.iter().any(|&(b, _)| b == blob_idx) {
                blob.lifetime -= 1;
            }
        }
        self.blobs.retain(|blob| {
            if blob.lifetime < 0 {
                trace!(id = blob.id, "Dropping expired blob");
                false
            } else {
                true
            }
        });

        // Unassigned measurements spawn fresh identities.
        for (measure_idx, measure) in measures.iter().enumerate() {
            if !assigned.iter().any(|&(_, m)| m == measure_idx) {
                let id = self.next_id;
                self.next_id += 1;
                trace!(id, x = measure.x, y = measure.y, "New blob");
                self.blobs.push(TrackedBlob::new(
                    id,
                    measure,
                    self.lifetime,
                    self.process_noise,
                    self.measurement_noise,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(tracker: &BlobTracker) -> Vec<u64> {
        tracker.blobs().iter().map(|b| b.id()).collect()
    }

    #[test]
    fn test_tracker_empty_update() {
        let mut tracker = BlobTracker::new(30);
        tracker.update(&[]);
        assert!(tracker.blobs().is_empty());
    }

    #[test]
    fn test_tracker_spawns_with_monotonic_ids() {
        let mut tracker = BlobTracker::new(30);
        tracker.update(&[BlobProperties::at(100, 100), BlobProperties::at(200, 200)]);
        assert_eq!(ids(&tracker), vec![1, 2]);
    }

    #[test]
    fn test_tracker_persistence_across_frames() {
        let mut tracker = BlobTracker::new(30);
        tracker.update(&[BlobProperties::at(100, 100), BlobProperties::at(200, 200)]);

        // Slightly moved measurements keep their identities.
        tracker.update(&[BlobProperties::at(105, 102), BlobProperties::at(198, 201)]);
        assert_eq!(tracker.blobs().len(), 2);
        let near_first = tracker
            .blobs()
            .iter()
            .find(|b| b.properties().x == 105)
            .unwrap();
        let near_second = tracker
            .blobs()
            .iter()
            .find(|b| b.properties().x == 198)
            .unwrap();
        assert_eq!(near_first.id(), 1);
        assert_eq!(near_second.id(), 2);
    }

    #[test]
    fn test_tracker_assignment_is_one_to_one() {
        let mut tracker = BlobTracker::new(30);
        tracker.update(&[BlobProperties::at(50, 50)]);

        // Two measurements near one blob: exactly one may update it,
        // the other spawns.
        tracker.update(&[BlobProperties::at(51, 50), BlobProperties::at(49, 50)]);
        assert_eq!(tracker.blobs().len(), 2);
        let updated: Vec<_> = tracker.blobs().iter().filter(|b| b.is_updated()).collect();
        assert_eq!(updated.len(), 2);
        let mut seen = ids(&tracker);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_tracker_nearest_pair_wins() {
        let mut tracker = BlobTracker::new(30);
        tracker.update(&[BlobProperties::at(0, 0), BlobProperties::at(100, 0)]);

        // One measurement between the two, closer to the second.
        tracker.update(&[BlobProperties::at(70, 0)]);
        let updated: Vec<_> = tracker
            .blobs()
            .iter()
            .filter(|b| b.is_updated())
            .map(|b| b.id())
            .collect();
        assert_eq!(updated, vec![2]);
    }

    #[test]
    fn test_tracker_occlusion_lifetime() {
        let mut tracker = BlobTracker::new(3);
        tracker.update(&[BlobProperties::at(10, 10)]);
        assert_eq!(tracker.blobs().len(), 1);

        // Unseen for exactly the lifetime: still there.
        for _ in 0..3 {
            tracker.update(&[]);
            assert_eq!(tracker.blobs().len(), 1);
        }
        // One more frame and it is gone.
        tracker.update(&[]);
        assert!(tracker.blobs().is_empty());
    }

    #[test]
    fn test_tracker_lifetime_resets_on_match() {
        let mut tracker = BlobTracker::new(2);
        tracker.update(&[BlobProperties::at(10, 10)]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.blobs().len(), 1);

        // A match renews the full lifetime.
        tracker.update(&[BlobProperties::at(11, 10)]);
        assert_eq!(tracker.blobs()[0].lifetime(), 2);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.blobs().len(), 1);
        tracker.update(&[]);
        assert!(tracker.blobs().is_empty());
    }

    #[test]
    fn test_tracker_ids_never_reused() {
        let mut tracker = BlobTracker::new(0);
        tracker.update(&[BlobProperties::at(10, 10)]);
        tracker.update(&[]);
        assert!(tracker.blobs().is_empty());

        tracker.update(&[BlobProperties::at(10, 10)]);
        assert_eq!(ids(&tracker), vec![2]);
    }

    #[test]
    fn test_tracker_follows_motion() {
        let mut tracker = BlobTracker::new(30);
        // A blob moving right at 5 px/frame, plus a stationary one far
        // away.
        tracker.update(&[BlobProperties::at(0, 0), BlobProperties::at(300, 300)]);
        for step in 1..10 {
            tracker.update(&[
                BlobProperties::at(step * 5, 0),
                BlobProperties::at(300, 300),
            ]);
        }
        let moving = tracker.blobs().iter().find(|b| b.id() == 1).unwrap();
        assert_eq!(moving.properties().x, 45);
        assert!(moving.properties().vx > 0.0);
        let still = tracker.blobs().iter().find(|b| b.id() == 2).unwrap();
        assert_eq!(still.properties().x, 300);
    }

    #[test]
    fn test_tracker_tie_break_is_generation_order() {
        let mut tracker = BlobTracker::new(30);
        tracker.update(&[BlobProperties::at(0, 0)]);

        // Two measurements equidistant from the single blob: the one
        // generated first wins the pairing, the other spawns id 2.
        tracker.update(&[BlobProperties::at(10, 0), BlobProperties::at(-10, 0)]);
        let first = tracker.blobs().iter().find(|b| b.id() == 1).unwrap();
        assert_eq!(first.properties().x, 10);
        let spawned = tracker.blobs().iter().find(|b| b.id() == 2).unwrap();
        assert_eq!(spawned.properties().x, -10);
    }
}
