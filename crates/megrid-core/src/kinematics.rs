use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::constants::{ELECTRON_MASS, MUON_MASS};

/// A Lorentz four-vector `(px, py, pz, e)` in GeV.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FourMomentum {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub e: f64,
}

impl FourMomentum {
    pub fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self { px, py, pz, e }
    }

    pub fn from_pt_eta_phi_m(pt: f64, eta: f64, phi: f64, m: f64) -> Self {
        let px = pt * phi.cos();
        let py = pt * phi.sin();
        let pz = pt * eta.sinh();
        let e = (px * px + py * py + pz * pz + m * m).sqrt();
        Self { px, py, pz, e }
    }

    /// A purely transverse vector with energy equal to its transverse momentum.
    pub fn transverse(px: f64, py: f64) -> Self {
        Self {
            px,
            py,
            pz: 0.0,
            e: px.hypot(py),
        }
    }

    pub fn pt(&self) -> f64 {
        self.px.hypot(self.py)
    }

    pub fn p(&self) -> f64 {
        (self.px * self.px + self.py * self.py + self.pz * self.pz).sqrt()
    }

    pub fn phi(&self) -> f64 {
        if self.px == 0.0 && self.py == 0.0 {
            0.0
        } else {
            self.py.atan2(self.px)
        }
    }

    /// Pseudorapidity; infinite along the beam axis.
    pub fn eta(&self) -> f64 {
        let pt = self.pt();
        if pt == 0.0 {
            return match self.pz.partial_cmp(&0.0) {
                Some(std::cmp::Ordering::Greater) => f64::INFINITY,
                Some(std::cmp::Ordering::Less) => f64::NEG_INFINITY,
                _ => 0.0,
            };
        }
        (self.pz / pt).asinh()
    }

    pub fn mass(&self) -> f64 {
        let m2 = self.e * self.e - self.p().powi(2);
        m2.max(0.0).sqrt()
    }

    /// Rotate counter-clockwise about the beam axis.
    pub fn rotate_z(&self, angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        Self {
            px: self.px * c - self.py * s,
            py: self.px * s + self.py * c,
            pz: self.pz,
            e: self.e,
        }
    }
}

impl Add for FourMomentum {
    type Output = FourMomentum;

    fn add(self, o: FourMomentum) -> FourMomentum {
        FourMomentum::new(self.px + o.px, self.py + o.py, self.pz + o.pz, self.e + o.e)
    }
}

impl Sub for FourMomentum {
    type Output = FourMomentum;

    fn sub(self, o: FourMomentum) -> FourMomentum {
        FourMomentum::new(self.px - o.px, self.py - o.py, self.pz - o.pz, self.e - o.e)
    }
}

impl Neg for FourMomentum {
    type Output = FourMomentum;

    fn neg(self) -> FourMomentum {
        FourMomentum::new(-self.px, -self.py, -self.pz, self.e)
    }
}

impl std::iter::Sum for FourMomentum {
    fn sum<I: Iterator<Item = FourMomentum>>(iter: I) -> FourMomentum {
        iter.fold(FourMomentum::default(), |a, b| a + b)
    }
}

/// Lepton mass from the magnitude of a PDG id; `None` for non-leptons.
pub fn lepton_mass(pdg_id: i32) -> Option<f64> {
    match pdg_id.abs() {
        11 => Some(ELECTRON_MASS),
        13 => Some(MUON_MASS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pt_eta_phi_roundtrip() {
        let p = FourMomentum::from_pt_eta_phi_m(40.0, -1.2, 2.5, MUON_MASS);
        assert_relative_eq!(p.pt(), 40.0, epsilon = 1e-10);
        assert_relative_eq!(p.eta(), -1.2, epsilon = 1e-10);
        assert_relative_eq!(p.phi(), 2.5, epsilon = 1e-10);
        assert_relative_eq!(p.mass(), MUON_MASS, epsilon = 1e-6);
    }

    #[test]
    fn test_rotate_z_preserves_pt_and_shifts_phi() {
        let p = FourMomentum::from_pt_eta_phi_m(25.0, 0.3, 0.4, 0.0);
        let r = p.rotate_z(1.0);
        assert_relative_eq!(r.pt(), p.pt(), epsilon = 1e-10);
        assert_relative_eq!(r.phi(), 1.4, epsilon = 1e-10);
        assert_relative_eq!(r.pz, p.pz);
    }

    #[test]
    fn test_sum_and_neg() {
        let a = FourMomentum::new(1.0, 2.0, 3.0, 10.0);
        let b = FourMomentum::new(-1.0, 0.5, 0.0, 5.0);
        let s: FourMomentum = [a, b].into_iter().sum();
        assert_eq!(s, FourMomentum::new(0.0, 2.5, 3.0, 15.0));
        assert_eq!((-a).px, -1.0);
        assert_eq!((a - b).e, 5.0);
    }

    #[test]
    fn test_eta_along_beam() {
        assert_eq!(FourMomentum::new(0.0, 0.0, 5.0, 5.0).eta(), f64::INFINITY);
        assert_eq!(FourMomentum::default().eta(), 0.0);
    }

    #[test]
    fn test_lepton_mass() {
        assert_eq!(lepton_mass(-11), Some(ELECTRON_MASS));
        assert_eq!(lepton_mass(13), Some(MUON_MASS));
        assert_eq!(lepton_mass(15), None);
    }
}
