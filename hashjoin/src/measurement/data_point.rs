/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use super::hash_table_bench::HashTableBench;
use crate::error::Result;
use crate::types::*;
use crate::CmdOpt;
use serde_derive::Serialize;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub hostname: String,
    pub memory_level: Option<ArgMemoryLevel>,
    pub devices: Option<u32>,
    pub operator: Option<ArgOperator>,
    pub key_distribution: Option<ArgKeyDistribution>,
    pub zipf_exponent: Option<f64>,
    pub null_percent: Option<u32>,
    pub shards: Option<usize>,
    pub inner_tuples: Option<usize>,
    pub fragment_tuples: Option<usize>,
    pub cache_entries: Option<usize>,
    pub force_one_to_many: Option<bool>,
    pub warm_up: Option<bool>,
    pub hash_type: Option<String>,
    pub entry_count: Option<usize>,
    pub shard_count: Option<usize>,
    pub hash_table_bytes: Option<usize>,
    pub cache_hits: Option<u64>,
    pub cache_misses: Option<u64>,
    pub verified_probes: Option<usize>,
    pub build_ns: Option<f64>,
    pub relation_gen_ns: Option<f64>,
}

impl DataPoint {
    pub fn new() -> Result<DataPoint> {
        let hostname = hostname::get_hostname().ok_or_else(|| "Couldn't get hostname")?;

        let dp = DataPoint {
            hostname,
            ..DataPoint::default()
        };

        Ok(dp)
    }

    pub fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> Result<DataPoint> {
        let dp = DataPoint {
            memory_level: Some(cmd.memory_level),
            devices: Some(cmd.devices),
            operator: Some(cmd.operator),
            key_distribution: Some(cmd.key_distribution),
            zipf_exponent: if cmd.key_distribution == ArgKeyDistribution::Zipf {
                Some(cmd.zipf_exponent)
            } else {
                None
            },
            null_percent: Some(cmd.null_percent),
            shards: Some(cmd.shards),
            fragment_tuples: Some(cmd.fragment_tuples),
            cache_entries: Some(cmd.cache_entries),
            force_one_to_many: Some(cmd.force_one_to_many),
            ..self.clone()
        };

        Ok(dp)
    }

    pub fn fill_from_hash_table_bench(&self, htb: &HashTableBench) -> DataPoint {
        DataPoint {
            inner_tuples: Some(htb.inner_len),
            devices: Some(htb.device_count),
            ..self.clone()
        }
    }

    pub fn set_init_time(&self, data_gen: Duration) -> DataPoint {
        DataPoint {
            relation_gen_ns: Some(data_gen.as_nanos() as f64),
            ..self.clone()
        }
    }
}
