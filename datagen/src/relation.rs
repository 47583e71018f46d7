// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Data set generators for join key columns.
//!
//! The generators produce key attributes following a random distribution.

use crate::error::{ErrorKind, Result};

use num_traits::{Bounded, NumCast};

use std::ops::RangeInclusive;

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

use rayon::prelude::*;

use zipf::ZipfDistribution;

/// A join key type.
///
/// `NULL` is stored inline as the smallest value of the type.
pub trait KeyAttribute: Copy + Sized {
    fn null_key() -> Self;
    fn try_from_i64(x: i64) -> Result<Self>;
}

macro_rules! impl_key_attribute {
    ($Type:ty) => {
        impl KeyAttribute for $Type {
            fn null_key() -> Self {
                <$Type as Bounded>::min_value()
            }

            fn try_from_i64(x: i64) -> Result<Self> {
                <$Type as NumCast>::from(x)
                    .filter(|&v| v != Self::null_key())
                    .ok_or_else(|| {
                        ErrorKind::IntegerOverflow(format!(
                            "Key {} doesn't fit into {}",
                            x,
                            stringify!($Type)
                        ))
                        .into()
                    })
            }
        }
    };
}

impl_key_attribute!(i16);
impl_key_attribute!(i32);
impl_key_attribute!(i64);

/// Generator for relations with uniform distribution.
pub struct UniformRelation;

impl UniformRelation {
    /// Generates a primary key attribute.
    ///
    /// The generated keys are unique and contiguous. The key range starts
    /// from `first_key` and ends at, i.e. including, `first_key + len - 1`.
    /// Keys are placed at random locations within the slice.
    ///
    /// `selectivity` specifies the percentage of keys that are not `NULL`.
    /// By default (`None`), the selectivity is 100%.
    pub fn gen_primary_key<T: KeyAttribute>(
        attr: &mut [T],
        first_key: i64,
        selectivity: Option<u32>,
    ) -> Result<()> {
        let selectivity = selectivity.unwrap_or(100);
        let mut rng = thread_rng();

        attr.iter_mut()
            .by_ref()
            .zip(first_key..)
            .map(|(x, i)| {
                T::try_from_i64(i).map(|i| {
                    *x = if rng.gen_range(0, 100) < selectivity {
                        i
                    } else {
                        T::null_key()
                    }
                })
            })
            .collect::<Result<()>>()?;

        attr.shuffle(&mut rng);
        Ok(())
    }

    /// Generates a primary key attribute in parallel.
    ///
    /// Produces the same key set as `gen_primary_key`, with all keys being
    /// non-`NULL`.
    pub fn gen_primary_key_par<T: KeyAttribute + Send>(attr: &mut [T], first_key: i64) -> Result<()> {
        let mut shuffled: Vec<(u64, T)> = (0..attr.len())
            .into_par_iter()
            .map_init(thread_rng, |rng, i| {
                T::try_from_i64(first_key + i as i64).map(|key| (rng.gen(), key))
            })
            .collect::<Result<_>>()?;

        shuffled.as_mut_slice().par_sort_unstable_by_key(|x| x.0);

        attr.par_iter_mut()
            .zip_eq(shuffled.into_par_iter())
            .for_each(|(x, t)| *x = t.1);

        Ok(())
    }

    /// Generates a foreign key attribute based on a primary key attribute.
    ///
    /// The generated keys are sampled from the primary key attribute, that
    /// is, they follow a foreign-key relationship.
    pub fn gen_foreign_key_from_primary_key<T: Copy>(fk_attr: &mut [T], pk_attr: &[T]) {
        let mut rng = thread_rng();

        fk_attr
            .iter_mut()
            .by_ref()
            .zip(pk_attr.iter().cycle())
            .for_each(|(fk, pk)| *fk = *pk);
        fk_attr.shuffle(&mut rng);
    }

    /// Generates a uniformly distributed attribute with duplicates.
    ///
    /// The generated values are sampled from `range`.
    pub fn gen_attr<T: KeyAttribute + Send>(attr: &mut [T], range: RangeInclusive<i64>) -> Result<()> {
        if range.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "Cannot sample from an empty key range".to_string(),
            ))?;
        }
        let between = Uniform::from(range);

        attr.par_iter_mut()
            .map_init(thread_rng, |rng, x| {
                T::try_from_i64(between.sample(rng)).map(|r| *x = r)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }

    /// Replaces a random `null_percent` share of the keys with `NULL`.
    pub fn inject_nulls<T: KeyAttribute>(attr: &mut [T], null_percent: u32) {
        let mut rng = thread_rng();

        attr.iter_mut()
            .filter(|_| rng.gen_range(0, 100) < null_percent)
            .for_each(|x| *x = T::null_key());
    }
}

/// Generator for relations with Zipf distribution.
pub struct ZipfRelation;

impl ZipfRelation {
    /// Generates an attribute following the Zipf distribution.
    ///
    /// The generated values are sampled from `first_key` to
    /// `first_key + num_elements - 1` (inclusive), with `first_key` being the
    /// most frequent value. Note that the exponent must be greater than 0.
    ///
    /// In the literature, num_elements is also called the alphabet size.
    pub fn gen_attr<T: KeyAttribute + Send>(
        attr: &mut [T],
        first_key: i64,
        num_elements: usize,
        exponent: f64,
    ) -> Result<()> {
        let between = ZipfDistribution::new(num_elements, exponent).map_err(|_| {
            ErrorKind::InvalidArgument(
                "ZipfDistribution requires num_elements and exponent greater than 0".to_string(),
            )
        })?;

        attr.par_iter_mut()
            .map_init(thread_rng, |rng, x| {
                let rank = between.sample(rng) as i64;
                T::try_from_i64(first_key + rank - 1).map(|r| *x = r)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }
}
