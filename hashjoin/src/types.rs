/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use device_mem::runtime::memory::MemoryLevel;
use join_hashtable::expr::JoinOp;
use serde_derive::Serialize;
use structopt::clap::{_clap_count_exprs, arg_enum};

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgMemoryLevel {
        Cpu,
        Gpu,
    }
}

impl From<ArgMemoryLevel> for MemoryLevel {
    fn from(level: ArgMemoryLevel) -> Self {
        match level {
            ArgMemoryLevel::Cpu => MemoryLevel::Cpu,
            ArgMemoryLevel::Gpu => MemoryLevel::Gpu,
        }
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgKeyDistribution {
        Unique,
        Uniform,
        Zipf,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgOperator {
        Eq,
        BwEq,
    }
}

impl From<ArgOperator> for JoinOp {
    fn from(op: ArgOperator) -> Self {
        match op {
            ArgOperator::Eq => JoinOp::Eq,
            ArgOperator::BwEq => JoinOp::BwEq,
        }
    }
}
