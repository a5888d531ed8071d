//! On-the-fly image augmentation applied per batch.

use ndarray::{s, Array4, ArrayViewMut3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FLIP_PROBABILITY: f32 = 0.5;

/// Random transforms applied independently to each image of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Augmentation {
    /// Probability of mirroring an image left-to-right.
    pub flip_probability: f32,
    /// Maximum absolute brightness offset; 0 disables jitter.
    pub brightness_jitter: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            flip_probability: DEFAULT_FLIP_PROBABILITY,
            brightness_jitter: 0.0,
        }
    }
}

impl Augmentation {
    /// Leaves images untouched. Used for validation batches.
    pub fn none() -> Self {
        Self {
            flip_probability: 0.0,
            brightness_jitter: 0.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.flip_probability <= 0.0 && self.brightness_jitter <= 0.0
    }

    /// Augment every image of an `N x C x H x W` batch in place.
    pub fn apply<R: Rng + ?Sized>(&self, batch: &mut Array4<f32>, rng: &mut R) {
        if self.is_identity() {
            return;
        }
        for mut image in batch.axis_iter_mut(Axis(0)) {
            self.apply_one(&mut image, rng);
        }
    }

    fn apply_one<R: Rng + ?Sized>(&self, image: &mut ArrayViewMut3<'_, f32>, rng: &mut R) {
        if self.flip_probability > 0.0 && rng.gen::<f32>() < self.flip_probability {
            flip_horizontal(image);
        }
        if self.brightness_jitter > 0.0 {
            let delta = rng.gen_range(-self.brightness_jitter..=self.brightness_jitter);
            image.mapv_inplace(|v| (v + delta).clamp(0.0, 1.0));
        }
    }
}

/// Mirror a `C x H x W` image along its width.
pub fn flip_horizontal(image: &mut ArrayViewMut3<'_, f32>) {
    let mirrored = image.slice(s![.., .., ..;-1]).to_owned();
    image.assign(&mirrored);
}
