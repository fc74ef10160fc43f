// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-point emulated time.
//!
//! A [`TimeValue`] is a whole number of seconds plus a sub-second part counted
//! in attoseconds (10^-18 s). All arithmetic goes through 128-bit integers so
//! no precision is ever lost to floating point, which keeps every run of a
//! machine bit-identical.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Attoseconds in one second.
pub const ATTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000_000;

const ATTOS: u128 = ATTOSECONDS_PER_SECOND as u128;

/// Largest representable finite number of seconds; anything beyond is `NEVER`.
pub const MAX_SECONDS: u64 = 1_000_000_000;

/// Emulated time as `(seconds, attoseconds)`.
///
/// Invariant: `attoseconds < ATTOSECONDS_PER_SECOND`. [`TimeValue::NEVER`]
/// compares greater than every finite time and absorbs addition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeValue {
    seconds: u64,
    attoseconds: u64,
}

impl TimeValue {
    pub const ZERO: Self = Self {
        seconds: 0,
        attoseconds: 0,
    };

    /// Sentinel for "disabled" or "infinitely far away".
    pub const NEVER: Self = Self {
        seconds: u64::MAX,
        attoseconds: 0,
    };

    /// Build a time value, carrying excess attoseconds into seconds.
    pub fn new(seconds: u64, attoseconds: u64) -> Self {
        Self::from_attoseconds(seconds as u128 * ATTOS + attoseconds as u128)
    }

    /// Reassemble a value from its stored fields.
    pub(crate) fn from_raw_parts(seconds: u64, attoseconds: u64) -> Self {
        if seconds == u64::MAX {
            return Self::NEVER;
        }
        Self::new(seconds, attoseconds)
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self::new(seconds, 0)
    }

    pub fn from_msec(msec: u64) -> Self {
        Self::from_attoseconds(msec as u128 * (ATTOS / 1_000))
    }

    pub fn from_usec(usec: u64) -> Self {
        Self::from_attoseconds(usec as u128 * (ATTOS / 1_000_000))
    }

    pub fn from_nsec(nsec: u64) -> Self {
        Self::from_attoseconds(nsec as u128 * (ATTOS / 1_000_000_000))
    }

    /// Convert a raw attosecond count; values past [`MAX_SECONDS`] become `NEVER`.
    pub fn from_attoseconds(attos: u128) -> Self {
        let seconds = attos / ATTOS;
        if seconds > MAX_SECONDS as u128 {
            return Self::NEVER;
        }
        Self {
            seconds: seconds as u64,
            attoseconds: (attos % ATTOS) as u64,
        }
    }

    /// Period of one cycle of a clock running at `hz`. A stopped clock never ticks.
    pub fn from_hz(hz: u32) -> Self {
        if hz == 0 {
            return Self::NEVER;
        }
        Self::from_attoseconds(ATTOS / hz as u128)
    }

    /// Duration of `count` cycles at `hz`, rounded up to the attosecond so that
    /// `TimeValue::cycles(n, hz).as_cycles(hz) == n`.
    pub fn cycles(count: u64, hz: u32) -> Self {
        if hz == 0 {
            return Self::NEVER;
        }
        let hz = hz as u128;
        Self::from_attoseconds((count as u128 * ATTOS).div_ceil(hz))
    }

    pub const fn seconds(&self) -> u64 {
        self.seconds
    }

    pub const fn attoseconds(&self) -> u64 {
        self.attoseconds
    }

    pub const fn is_never(&self) -> bool {
        self.seconds == u64::MAX
    }

    pub const fn is_zero(&self) -> bool {
        self.seconds == 0 && self.attoseconds == 0
    }

    /// Total attoseconds; `NEVER` saturates to `u128::MAX`.
    pub fn as_attoseconds(&self) -> u128 {
        if self.is_never() {
            return u128::MAX;
        }
        self.seconds as u128 * ATTOS + self.attoseconds as u128
    }

    /// Number of whole cycles of a `hz` clock that fit in this duration.
    pub fn as_cycles(&self, hz: u32) -> u64 {
        if self.is_never() {
            return u64::MAX;
        }
        let cycles = self.as_attoseconds() * hz as u128 / ATTOS;
        u64::try_from(cycles).unwrap_or(u64::MAX)
    }

    /// Lossy conversion for display and statistics only.
    pub fn as_f64_seconds(&self) -> f64 {
        if self.is_never() {
            return f64::INFINITY;
        }
        self.seconds as f64 + self.attoseconds as f64 / ATTOSECONDS_PER_SECOND as f64
    }

    /// `self - rhs`, or `None` when `rhs` is later than `self`.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        if self.is_never() {
            return Some(Self::NEVER);
        }
        if rhs.is_never() {
            return None;
        }
        self.as_attoseconds()
            .checked_sub(rhs.as_attoseconds())
            .map(Self::from_attoseconds)
    }

    pub fn mul(self, factor: u32) -> Self {
        if self.is_never() {
            return Self::NEVER;
        }
        Self::from_attoseconds(self.as_attoseconds() * factor as u128)
    }

    pub fn div(self, divisor: u32) -> Self {
        if self.is_never() || divisor == 0 {
            return Self::NEVER;
        }
        Self::from_attoseconds(self.as_attoseconds() / divisor as u128)
    }

    /// Scale by `num / den` without an intermediate rounding step.
    pub fn mul_rational(self, num: u32, den: u32) -> Self {
        if self.is_never() || den == 0 {
            return Self::NEVER;
        }
        Self::from_attoseconds(self.as_attoseconds() * num as u128 / den as u128)
    }
}

impl Add for TimeValue {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        if self.is_never() || rhs.is_never() {
            return Self::NEVER;
        }
        Self::from_attoseconds(self.as_attoseconds() + rhs.as_attoseconds())
    }
}

impl AddAssign for TimeValue {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Saturating subtraction: never goes below zero.
impl Sub for TimeValue {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.checked_sub(rhs).unwrap_or(Self::ZERO)
    }
}

impl SubAssign for TimeValue {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return write!(f, "never");
        }
        write!(f, "{}.{:018}", self.seconds, self.attoseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_carries_attoseconds() {
        let t = TimeValue::new(1, ATTOSECONDS_PER_SECOND + 5);
        assert_eq!(t.seconds(), 2);
        assert_eq!(t.attoseconds(), 5);
    }

    #[test]
    fn cycles_round_trip_exactly() {
        let hz = 3_579_545;
        let t = TimeValue::cycles(3791, hz);
        assert_eq!(t.as_cycles(hz), 3791);
        assert_eq!(TimeValue::cycles(hz as u64, hz), TimeValue::from_seconds(1));
    }

    #[test]
    fn never_is_absorbing_and_greatest() {
        let t = TimeValue::from_msec(5);
        assert!(TimeValue::NEVER > t);
        assert!((TimeValue::NEVER + t).is_never());
        assert!((t + TimeValue::NEVER).is_never());
        assert_eq!(t - TimeValue::NEVER, TimeValue::ZERO);
        assert!(TimeValue::from_hz(0).is_never());
    }

    #[test]
    fn subtraction_saturates() {
        let a = TimeValue::from_usec(10);
        let b = TimeValue::from_usec(25);
        assert_eq!(a - b, TimeValue::ZERO);
        assert_eq!(a.checked_sub(b), None);
        assert_eq!(b - a, TimeValue::from_usec(15));
    }

    #[test]
    fn rational_scaling_keeps_precision() {
        let third = TimeValue::from_seconds(1).mul_rational(1, 3);
        assert_eq!(third.attoseconds(), 333_333_333_333_333_333);
        assert_eq!(TimeValue::from_nsec(7).mul(3), TimeValue::from_nsec(21));
        assert_eq!(TimeValue::from_nsec(21).div(3), TimeValue::from_nsec(7));
        assert!(TimeValue::from_nsec(1).div(0).is_never());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = TimeValue::new(1, 0);
        let b = TimeValue::new(0, ATTOSECONDS_PER_SECOND - 1);
        assert!(a > b);
    }

    #[test]
    fn display_pads_attoseconds() {
        assert_eq!(TimeValue::new(3, 42).to_string(), "3.000000000000000042");
        assert_eq!(TimeValue::NEVER.to_string(), "never");
    }
}
