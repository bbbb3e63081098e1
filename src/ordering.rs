//! Ordering of loaded instances into volumes.
//!
//! Instances are grouped by SeriesInstanceUID. Within a series they are sorted
//! along the slice normal of the first instance; when several leading
//! instances share the same position the series is treated as a time
//! sequence and re-emitted timepoint-major. The resulting order defines the
//! index space of volumetric response buffers: with `S` slices per timepoint
//! of `H x W` pixels, slice `i` of timepoint `t` starts at `(t * S + i) * H * W`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::loader::ImageInstance;

/// Positions closer than this are considered the same slice location.
pub const SAME_POSITION_TOLERANCE: f64 = 1e-3;

/// One ordered series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub uid: String,
    /// Number of timepoints detected (1 when there is no time axis).
    pub timepoints: usize,
    pub instances: Vec<ImageInstance>,
}

impl Series {
    /// Number of distinct slice positions per timepoint.
    pub fn slices_per_timepoint(&self) -> usize {
        self.instances.len() / self.timepoints.max(1)
    }
}

/// Group instances by series and order each series.
///
/// The order in which series are returned is an implementation detail.
pub fn order_series(instances: Vec<ImageInstance>) -> Result<Vec<Series>> {
    let mut groups: BTreeMap<String, Vec<ImageInstance>> = BTreeMap::new();
    for instance in instances {
        groups
            .entry(instance.series_uid.clone())
            .or_default()
            .push(instance);
    }

    groups
        .into_iter()
        .map(|(uid, members)| {
            let (timepoints, instances) = sort_series_images(&uid, members)?;
            debug!(
                "Series {uid}: {} instance(s), {timepoints} timepoint(s)",
                instances.len()
            );
            Ok(Series {
                uid,
                timepoints,
                instances,
            })
        })
        .collect()
}

/// Order all instances and flatten the series back into one list.
pub fn sort_images(instances: Vec<ImageInstance>) -> Result<Vec<ImageInstance>> {
    Ok(order_series(instances)?
        .into_iter()
        .flat_map(|series| series.instances)
        .collect())
}

/// Order the members of one series, returning the timepoint count with them.
///
/// Series without spatial information are returned in their original order.
/// Time sequences assume the repeated acquisitions of one slice location are
/// adjacent after the spatial sort; any other interleaving is not detected.
pub fn sort_series_images(
    series_uid: &str,
    images: Vec<ImageInstance>,
) -> Result<(usize, Vec<ImageInstance>)> {
    let Some((origin, direction)) = spatial_reference(&images) else {
        return Ok((1, images));
    };
    if images
        .iter()
        .any(|i| i.position.is_none() || i.orientation.is_none())
    {
        warn!("Series {series_uid} mixes instances with and without geometry, keeping load order");
        return Ok((1, images));
    }

    let projection = |image: &ImageInstance| {
        image
            .position_vec()
            .map(|p| (p - origin).dot(direction))
            .unwrap_or_default()
    };

    let mut spatial_sorted = images;
    spatial_sorted.sort_by(|a, b| {
        let diff = projection(a) - projection(b);
        if diff < 0.0 {
            Ordering::Less
        } else if diff > 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });

    let timepoints = determine_timepoints(&spatial_sorted);
    if timepoints == 1 {
        return Ok((1, spatial_sorted));
    }

    if spatial_sorted.len() % timepoints != 0 {
        return Err(Error::InconsistentVolume {
            series_uid: series_uid.to_string(),
            instances: spatial_sorted.len(),
            timepoints,
        });
    }

    for block in spatial_sorted.chunks_mut(timepoints) {
        block.sort_by_key(|image| image.instance_number);
    }

    let slices = spatial_sorted.len() / timepoints;
    let mut result = Vec::with_capacity(spatial_sorted.len());
    for t in 0..timepoints {
        for i in 0..slices {
            result.push(spatial_sorted[i * timepoints + t].with_timepoint(t));
        }
    }
    Ok((timepoints, result))
}

/// Count the leading instances sharing the first instance's position.
///
/// The input must already be sorted along the slice normal.
pub fn determine_timepoints(spatially_sorted: &[ImageInstance]) -> usize {
    let Some(first) = spatially_sorted.first().and_then(ImageInstance::position_vec) else {
        return 1;
    };

    let mut end_index = 1;
    while end_index < spatially_sorted.len() {
        let same_location = spatially_sorted[end_index]
            .position_vec()
            .is_some_and(|p| (p - first).magnitude() < SAME_POSITION_TOLERANCE);
        if !same_location {
            break;
        }
        end_index += 1;
    }
    end_index
}

fn spatial_reference(
    images: &[ImageInstance],
) -> Option<(lin_alg::f64::Vec3, lin_alg::f64::Vec3)> {
    let first = images.first()?;
    Some((first.position_vec()?, first.normal()?))
}
