//! Activation matrices, counter allocation and the per module state
//! the emitter consumes. The superclock is the least common multiple
//! of the driver periods; a vector length dividing it is picked by a
//! prime factor heuristic bounded by the backend cap.

use cadenza_compiler::{
    module::BuildModule,
    rx::{DriverClass, DriverSignature},
};
use immutable_chunkmap::map::MapS as Map;
use std::hash::{Hash, Hasher};

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs().max(1)
}

/// one driver firing in a superclock frame, with its remaining divider
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationCell {
    pub driver: DriverSignature,
    pub divider: i64,
}

impl ActivationCell {
    pub fn new(driver: &DriverSignature, divider: i64) -> Self {
        ActivationCell { driver: driver.stripped(), divider }
    }
}

/// rows are superclock frames; each row lists the drivers firing in
/// that frame
#[derive(Debug, Clone)]
pub struct ActivationMatrix {
    pub rows: Vec<Vec<ActivationCell>>,
    pub oversampling: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationCounter {
    /// state slot index backing the counter
    pub index: u32,
    pub divider: i64,
    /// assigned bit in the activity mask words, -1 before allocation
    pub bitmask_index: i64,
}

pub type CounterIndices = Map<DriverSignature, ActivationCounter>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverActivity {
    Always,
    Never,
    Bit(i64),
}

/// the vector length cap typical backends impose
pub const MAX_VECTOR_LENGTH: i64 = 16;

/// Build the activation matrix for the driver set at the given vector
/// length. Returns the matrix and the jitter: the smallest stride
/// between activations, which bounds row combining.
pub fn activation_matrix(
    drivers: &[DriverSignature],
    vector: i64,
) -> (ActivationMatrix, i64) {
    let superclock = drivers.iter().fold(1i64, |acc, d| {
        let vmul = (vector * d.mul as i64).max(1);
        let m = vmul / gcd(vmul, d.div as i64);
        (acc * m) / gcd(acc, m)
    });
    let mut rows = vec![Vec::new(); superclock.max(1) as usize];
    let mut jitter = superclock;
    for d in drivers {
        let mut mul = (d.mul as i64 * vector).max(1);
        let mut div = d.div as i64;
        let g = gcd(mul, div);
        if g != 1 {
            mul /= g;
            div /= g;
        }
        let stride = (superclock / mul).max(1);
        if stride < jitter {
            jitter = stride;
        }
        let mut i = 0usize;
        while i < rows.len() {
            rows[i].push(ActivationCell::new(d, div));
            i += stride as usize;
        }
    }
    (ActivationMatrix { rows, oversampling: vector }, jitter)
}

/// Pick the SIMD batch length: the most common prime factor of the
/// activation dividers, accumulated while it still divides the
/// superclock and stays under the cap.
pub fn compute_auspicious_vector_length(
    scalar: &ActivationMatrix,
    max_vector_length: i64,
) -> i64 {
    const TEST_PRIMES: [i64; 8] = [2, 3, 5, 7, 9, 11, 13, 15];
    let mut vector_len = 1i64;
    loop {
        let mut occurrences: fxhash::FxHashMap<i64, i64> = fxhash::FxHashMap::default();
        let mut common = 1i64;
        for row in &scalar.rows {
            for act in row {
                for p in TEST_PRIMES {
                    if act.divider % (p * vector_len) == 0 {
                        let c = occurrences.entry(p).or_insert(0);
                        *c += 1;
                        if *c > occurrences.get(&common).copied().unwrap_or(0) {
                            common = p;
                        }
                    }
                }
            }
        }
        if common <= 1 {
            return vector_len;
        }
        if vector_len * common > max_vector_length {
            return vector_len;
        }
        vector_len *= common;
    }
}

/// merge runs of `jitter` rows into one; activation order within the
/// combined frame is preserved
pub fn combine_rows(src: &ActivationMatrix, jitter: i64) -> ActivationMatrix {
    if jitter < 2 {
        return src.clone();
    }
    let n = src.rows.len() / jitter as usize;
    let mut rows = vec![Vec::new(); n];
    for (i, row) in rows.iter_mut().enumerate() {
        for j in 0..jitter as usize {
            row.extend(src.rows[i * jitter as usize + j].iter().cloned());
        }
    }
    ActivationMatrix { rows, oversampling: src.oversampling / jitter }
}

/// Express driver rates relative to the fastest driver as reduced
/// rationals; the matrix math runs on these small multipliers, not on
/// absolute sample rates.
pub fn normalize_rates(drivers: &[DriverSignature]) -> Vec<DriverSignature> {
    let max = drivers.iter().map(|d| d.ratio()).fold(f64::NAN, f64::max);
    if !max.is_finite() || max <= 0.0 {
        return drivers.to_vec();
    }
    drivers
        .iter()
        .map(|d| {
            let mut n = d.mul;
            let mut q = d.div * max;
            // scale fractional rates up to integers before reducing
            while (n.fract() != 0.0 || q.fract() != 0.0) && n < 1e12 && q < 1e12 {
                n *= 10.0;
                q *= 10.0;
            }
            let g = gcd(n as i64, q as i64) as f64;
            let mut out = d.clone();
            out.set_multiplier(n / g, q / g);
            out
        })
        .collect()
}

fn driver_uid(d: &DriverSignature) -> u64 {
    let mut h = fxhash::FxHasher64::default();
    d.hash(&mut h);
    h.finish()
}

/// Counters exist only for activation cells still carrying a divider;
/// each gets a state slot and, afterwards, a bit in the mask words.
pub fn counter_set(build: &mut BuildModule, amtx: &ActivationMatrix) -> CounterIndices {
    let mut set = CounterIndices::new();
    for row in &amtx.rows {
        for cell in row {
            if cell.divider > 1 {
                let key = cell.driver.stripped();
                if set.get(&key).is_none() {
                    let index = build.get_index(driver_uid(&key));
                    set.insert_cow(
                        key,
                        ActivationCounter {
                            index,
                            divider: cell.divider,
                            bitmask_index: -1,
                        },
                    );
                }
            }
        }
    }
    set
}

/// assign mask bits in driver order; returns the number of bits used
pub fn assign_mask_bits(set: &mut CounterIndices) -> usize {
    let keys: Vec<DriverSignature> = set.into_iter().map(|(k, _)| k.clone()).collect();
    let mut bit = 0i64;
    for k in keys {
        if let Some(c) = set.get_mut_cow(&k) {
            c.bitmask_index = bit;
            bit += 1;
        }
    }
    bit as usize
}

/// Driver activity resolution for one compilation pass: which drivers
/// are live and which mask bit gates each counter driven one. Drivers
/// match by clock identity so rate normalization does not split them.
pub struct CodeGenPass {
    pub label: String,
    drivers: Vec<DriverSignature>,
    counters: CounterIndices,
    all_active: bool,
}

impl CodeGenPass {
    pub fn new(label: &str, counters: CounterIndices) -> Self {
        CodeGenPass {
            label: label.to_string(),
            drivers: Vec::new(),
            counters,
            all_active: false,
        }
    }

    /// the initialization pass runs every reactive node once: every
    /// inserted driver answers `Always` regardless of counters
    pub fn with_all_active(mut self) -> Self {
        self.all_active = true;
        self
    }

    pub fn insert(&mut self, driver: &DriverSignature) {
        let d = driver.stripped();
        if !self.drivers.iter().any(|x| x.same_clock(&d)) {
            self.drivers.push(d);
        }
    }

    fn inserted(&self, d: &DriverSignature) -> bool {
        self.drivers.iter().any(|x| x.same_clock(d))
    }

    pub fn is_driver_active(&self, driver: &DriverSignature) -> DriverActivity {
        let d = driver.stripped();
        if !self.inserted(&d) {
            return DriverActivity::Never;
        }
        if self.all_active {
            return DriverActivity::Always;
        }
        match d.class {
            DriverClass::User => {
                let ctr = (&self.counters)
                    .into_iter()
                    .find(|(k, _)| k.same_clock(&d))
                    .map(|(_, c)| *c);
                match ctr {
                    Some(c) if c.bitmask_index >= 0 => {
                        DriverActivity::Bit(c.bitmask_index)
                    }
                    _ => DriverActivity::Always,
                }
            }
            _ => DriverActivity::Always,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drv(key: &str, mul: f64, div: f64) -> DriverSignature {
        DriverSignature::user(&arcstr::ArcStr::from(key), mul, div)
    }

    #[test]
    fn single_driver_matrix_is_dense() {
        let (m, jitter) = activation_matrix(&[drv("audio", 1.0, 1.0)], 1);
        assert_eq!(m.rows.len(), 1);
        assert_eq!(jitter, 1);
        assert_eq!(m.rows[0].len(), 1);
    }

    #[test]
    fn divided_driver_strides_through_the_superclock() {
        // one full rate clock, one at a third of it
        let (m, jitter) =
            activation_matrix(&[drv("audio", 1.0, 1.0), drv("ctl", 1.0, 3.0)], 3);
        assert_eq!(m.rows.len(), 3);
        assert_eq!(jitter, 1);
        // the full rate driver appears in every frame
        assert!(m.rows.iter().all(|r| r.iter().any(|c| c.divider == 1)));
    }

    #[test]
    fn vector_length_respects_cap() {
        let (m, _) = activation_matrix(&[drv("a", 1.0, 8.0)], 1);
        let v = compute_auspicious_vector_length(&m, MAX_VECTOR_LENGTH);
        assert!(v <= MAX_VECTOR_LENGTH);
        assert_eq!(8 % v, 0);
    }

    #[test]
    fn counters_only_for_divided_drivers() {
        let mut build = BuildModule::new(
            cadenza_compiler::typ::Type::Nil,
            cadenza_compiler::typ::Type::Nil,
        );
        let (m, _) =
            activation_matrix(&[drv("audio", 1.0, 1.0), drv("ctl", 1.0, 4.0)], 1);
        let mut set = counter_set(&mut build, &m);
        assert_eq!(set.len(), 1);
        let bits = assign_mask_bits(&mut set);
        assert_eq!(bits, 1);
        let pass = {
            let mut p = CodeGenPass::new("eval", set);
            p.insert(&drv("audio", 1.0, 1.0));
            p.insert(&drv("ctl", 1.0, 4.0));
            p
        };
        assert_eq!(
            pass.is_driver_active(&drv("audio", 1.0, 1.0)),
            DriverActivity::Always
        );
        assert_eq!(pass.is_driver_active(&drv("ctl", 1.0, 4.0)), DriverActivity::Bit(0));
        assert_eq!(
            pass.is_driver_active(&drv("absent", 1.0, 1.0)),
            DriverActivity::Never
        );
    }
}
