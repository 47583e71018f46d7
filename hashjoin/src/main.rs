/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

mod error;
mod measurement;
mod types;

use crate::error::Result;
use crate::measurement::data_point::DataPoint;
use crate::measurement::harness;
use crate::measurement::hash_table_bench::HashTableBenchBuilder;
use crate::types::*;

use std::path::PathBuf;

use structopt::StructOpt;

fn main() -> Result<()> {
    env_logger::init();

    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    let (htb, data_gen_time) = HashTableBenchBuilder::default()
        .inner_len(cmd.inner_rel_tuples)
        .fragment_len(cmd.fragment_tuples)
        .key_distribution(cmd.key_distribution)
        .zipf_exponent(cmd.zipf_exponent)
        .null_percent(cmd.null_percent)
        .shard_count(cmd.shards)
        .memory_level(cmd.memory_level.into())
        .device_count(cmd.devices)
        .device_memory_bytes(cmd.device_memory_bytes)
        .cache_entries(cmd.cache_entries)
        .op(cmd.operator.into())
        .force_one_to_many(cmd.force_one_to_many)
        .build_with_data_gen()?;

    let dp = DataPoint::new()?
        .fill_from_cmd_options(&cmd)?
        .fill_from_hash_table_bench(&htb)
        .set_init_time(data_gen_time);

    harness::measure(
        "join_hash_table",
        cmd.repeat,
        cmd.csv,
        dp,
        Box::new(move || htb.run()),
    )?;

    Ok(())
}

#[derive(StructOpt)]
#[structopt(
    name = "hashjoin",
    about = "A benchmark for building equi-join hash tables"
)]
pub struct CmdOpt {
    /// Number of times to repeat benchmark
    #[structopt(short = "r", long = "repeat", default_value = "30")]
    repeat: u32,

    /// Output filename for measurement CSV file
    #[structopt(long = "csv", parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Memory level at which to build the hash table.
    //   cpu: Host memory (default)
    //   gpu: Device memory of the simulated devices
    #[structopt(
        long = "memory-level",
        default_value = "Cpu",
        possible_values = &ArgMemoryLevel::variants(),
        case_insensitive = true
    )]
    memory_level: ArgMemoryLevel,

    /// Number of devices at the GPU memory level
    #[structopt(long = "devices", default_value = "1")]
    devices: u32,

    /// Memory capacity of each simulated device (bytes)
    #[structopt(long = "device-memory-bytes", default_value = "1073741824")]
    device_memory_bytes: usize,

    /// Set the inner relation size (tuples)
    #[structopt(long = "inner-rel-tuples", default_value = "1048576")]
    inner_rel_tuples: usize,

    /// Maximum number of tuples per fragment of the inner relation
    #[structopt(long = "fragment-tuples", default_value = "262144")]
    fragment_tuples: usize,

    /// Distribution of the inner join keys.
    //   unique: Primary keys (default)
    //   uniform: Keys with uniformly distributed duplicates
    //   zipf: Keys with Zipf-skewed duplicates
    #[structopt(
        long = "key-distribution",
        default_value = "Unique",
        possible_values = &ArgKeyDistribution::variants(),
        case_insensitive = true
    )]
    key_distribution: ArgKeyDistribution,

    /// Zipf exponent for Zipf-skewed keys
    #[structopt(long = "zipf-exponent", default_value = "1.0")]
    zipf_exponent: f64,

    /// Percentage of inner join keys that are NULL
    #[structopt(long = "null-percent", default_value = "0")]
    null_percent: u32,

    /// Shard the inner relation on the join key; 0 disables sharding
    #[structopt(long = "shards", default_value = "0")]
    shards: usize,

    /// Join operator.
    //   eq: NULL never matches (default)
    //   bweq: NULL matches NULL
    #[structopt(
        long = "operator",
        default_value = "Eq",
        possible_values = &ArgOperator::variants(),
        case_insensitive = true
    )]
    operator: ArgOperator,

    /// Number of hash tables to cache across runs; 0 disables the cache
    #[structopt(long = "cache-entries", default_value = "0")]
    cache_entries: usize,

    /// Build the one-to-many layout without trying one-to-one first
    #[structopt(long = "force-one-to-many")]
    force_one_to_many: bool,
}
