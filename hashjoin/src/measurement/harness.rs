/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use super::data_point::DataPoint;
use super::hash_table_bench::HashTablePoint;
use crate::error::Result;
use error_chain::ensure;
use log::info;
use std::path::PathBuf;

/// Runs `func` once for warm-up and `repeat` times for measurement.
///
/// The warm-up run also reports the data generation time of the template.
/// With a cache, the warm-up run is expected to miss and the other runs to
/// hit.
pub fn measure(
    name: &str,
    repeat: u32,
    out_file_name: Option<PathBuf>,
    template: DataPoint,
    mut func: Box<dyn FnMut() -> Result<HashTablePoint>>,
) -> Result<()> {
    let measurements = (0..=repeat)
        .zip(std::iter::once(true).chain(std::iter::repeat(false)))
        .map(|(run, warm_up)| -> Result<DataPoint> {
            let p = func()?;
            info!(
                "{} run {}: {:?} ns, cache hits {:?}",
                name, run, p.build_ns, p.cache_hits
            );

            Ok(DataPoint {
                warm_up: Some(warm_up),
                relation_gen_ns: if warm_up {
                    template.relation_gen_ns
                } else {
                    None
                },
                hash_type: p.hash_type,
                entry_count: p.entry_count,
                shard_count: p.shard_count,
                hash_table_bytes: p.hash_table_bytes,
                cache_hits: p.cache_hits,
                cache_misses: p.cache_misses,
                verified_probes: p.verified_probes,
                build_ns: p.build_ns,
                ..template.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(ofn) = out_file_name {
        let csv_file = std::fs::File::create(ofn)?;
        let mut csv = csv::Writer::from_writer(csv_file);
        ensure!(
            measurements
                .iter()
                .try_for_each(|row| csv.serialize(row))
                .is_ok(),
            "Couldn't write serialized measurements"
        );
        csv.flush()?;
    }

    Ok(())
}
