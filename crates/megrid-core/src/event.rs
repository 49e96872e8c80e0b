//! Per-event kinematics: building four-momenta from table rows and
//! extracting grid coordinates from them.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::kinematics::{FourMomentum, lepton_mass};
use crate::row::RowData;

// ---------------------------------------------------------------------------
// Topology and coordinate selectors
// ---------------------------------------------------------------------------

/// Jet content of a grid's coordinate space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    #[serde(alias = "lvlv")]
    Dilepton,
    #[serde(alias = "lvlvj")]
    OneJet,
    #[serde(alias = "lvlvjj")]
    TwoJet,
}

impl Topology {
    /// Jets pulled from the event for coordinate extraction.
    pub fn jets(&self) -> usize {
        match self {
            Topology::Dilepton => 0,
            Topology::OneJet => 1,
            Topology::TwoJet => 2,
        }
    }
}

impl std::str::FromStr for Topology {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dilepton" | "lvlv" | "0j" => Ok(Topology::Dilepton),
            "one_jet" | "lvlvj" | "1j" => Ok(Topology::OneJet),
            "two_jet" | "lvlvjj" | "2j" => Ok(Topology::TwoJet),
            other => Err(GridError::InvalidConfig(format!("unknown topology '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectId {
    Lp,
    Lm,
    LeadJet,
    SubleadJet,
    Met,
    Recoil,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Px,
    Py,
    Pz,
    E,
    Pt,
    Eta,
    Phi,
}

impl Component {
    pub fn of(&self, p: &FourMomentum) -> f64 {
        match self {
            Component::Px => p.px,
            Component::Py => p.py,
            Component::Pz => p.pz,
            Component::E => p.e,
            Component::Pt => p.pt(),
            Component::Eta => p.eta(),
            Component::Phi => p.phi(),
        }
    }
}

/// One grid coordinate: a component of a named physics object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateSpec {
    pub object: ObjectId,
    pub component: Component,
}

impl CoordinateSpec {
    /// Parse `object.component`, e.g. `lp.px`, `leadj.Z()` or `met.pt`.
    pub fn parse(s: &str) -> Result<Self> {
        let (obj, comp) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| GridError::InvalidConfig(format!("coordinate '{s}' is not object.component")))?;
        let object = match obj.to_ascii_lowercase().as_str() {
            "lp" => ObjectId::Lp,
            "lm" => ObjectId::Lm,
            "leadj" => ObjectId::LeadJet,
            "subleadj" => ObjectId::SubleadJet,
            "met" => ObjectId::Met,
            "recoil" => ObjectId::Recoil,
            other => {
                return Err(GridError::InvalidConfig(format!("unknown object '{other}' in '{s}'")));
            }
        };
        let comp = comp.trim_end_matches("()").to_ascii_lowercase();
        let component = match comp.as_str() {
            "x" | "px" => Component::Px,
            "y" | "py" => Component::Py,
            "z" | "pz" => Component::Pz,
            "e" | "t" => Component::E,
            "pt" => Component::Pt,
            "eta" => Component::Eta,
            "phi" => Component::Phi,
            other => {
                return Err(GridError::InvalidConfig(format!("unknown component '{other}' in '{s}'")));
            }
        };
        Ok(Self { object, component })
    }

    pub fn parse_all(specs: &[String]) -> Result<Vec<Self>> {
        specs.iter().map(|s| Self::parse(s)).collect()
    }
}

// ---------------------------------------------------------------------------
// Event schema
// ---------------------------------------------------------------------------

macro_rules! schema_defaults {
    ($($fn:ident => $val:expr),* $(,)?) => {
        $(fn $fn() -> String { $val.to_string() })*
    };
}

schema_defaults! {
    default_event_number => "EventNumber",
    default_run_number => "RunNumber",
    default_lep_id0 => "lepID0",
    default_lep_id1 => "lepID1",
    default_lep_pt0 => "lepPt0",
    default_lep_pt1 => "lepPt1",
    default_lep_eta0 => "lepEta0",
    default_lep_eta1 => "lepEta1",
    default_lep_phi0 => "lepPhi0",
    default_lep_phi1 => "lepPhi1",
    default_jet_n => "m_jet_n",
    default_jet_pt => "m_jet_pt",
    default_jet_eta => "m_jet_eta",
    default_jet_phi => "m_jet_phi",
    default_met_x => "MET_x",
    default_met_y => "MET_y",
    default_met => "MET",
    default_trackmet_x => "MET_x_TrackHWW",
    default_trackmet_y => "MET_y_TrackHWW",
    default_vertices => "Nvxp",
    default_pileup => "averageIntPerXing",
}

fn default_channel_number() -> Option<String> {
    Some("mc_channel_number".to_string())
}

fn default_unit() -> f64 {
    crate::constants::GEV
}

/// Column names of the event table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    #[serde(default = "default_event_number")]
    pub event_number: String,
    #[serde(default = "default_run_number")]
    pub run_number: String,
    /// Overrides the run number when present in the table.
    #[serde(default = "default_channel_number")]
    pub channel_number: Option<String>,
    #[serde(default = "default_lep_id0")]
    pub lep_id0: String,
    #[serde(default = "default_lep_id1")]
    pub lep_id1: String,
    #[serde(default = "default_lep_pt0")]
    pub lep_pt0: String,
    #[serde(default = "default_lep_pt1")]
    pub lep_pt1: String,
    #[serde(default = "default_lep_eta0")]
    pub lep_eta0: String,
    #[serde(default = "default_lep_eta1")]
    pub lep_eta1: String,
    #[serde(default = "default_lep_phi0")]
    pub lep_phi0: String,
    #[serde(default = "default_lep_phi1")]
    pub lep_phi1: String,
    #[serde(default = "default_jet_n")]
    pub jet_n: String,
    #[serde(default = "default_jet_pt")]
    pub jet_pt: String,
    #[serde(default = "default_jet_eta")]
    pub jet_eta: String,
    #[serde(default = "default_jet_phi")]
    pub jet_phi: String,
    #[serde(default = "default_met_x")]
    pub met_x: String,
    #[serde(default = "default_met_y")]
    pub met_y: String,
    #[serde(default = "default_met")]
    pub met: String,
    #[serde(default = "default_trackmet_x")]
    pub trackmet_x: String,
    #[serde(default = "default_trackmet_y")]
    pub trackmet_y: String,
    #[serde(default = "default_vertices")]
    pub vertices: String,
    #[serde(default = "default_pileup")]
    pub pileup: String,
    /// Divisor converting momenta in the table to GeV.
    #[serde(default = "default_unit")]
    pub unit: f64,
}

impl Default for EventSchema {
    fn default() -> Self {
        Self {
            event_number: default_event_number(),
            run_number: default_run_number(),
            channel_number: default_channel_number(),
            lep_id0: default_lep_id0(),
            lep_id1: default_lep_id1(),
            lep_pt0: default_lep_pt0(),
            lep_pt1: default_lep_pt1(),
            lep_eta0: default_lep_eta0(),
            lep_eta1: default_lep_eta1(),
            lep_phi0: default_lep_phi0(),
            lep_phi1: default_lep_phi1(),
            jet_n: default_jet_n(),
            jet_pt: default_jet_pt(),
            jet_eta: default_jet_eta(),
            jet_phi: default_jet_phi(),
            met_x: default_met_x(),
            met_y: default_met_y(),
            met: default_met(),
            trackmet_x: default_trackmet_x(),
            trackmet_y: default_trackmet_y(),
            vertices: default_vertices(),
            pileup: default_pileup(),
            unit: default_unit(),
        }
    }
}

impl EventSchema {
    /// Columns every event must carry.
    pub fn required(&self) -> Vec<&str> {
        vec![
            self.event_number.as_str(),
            self.run_number.as_str(),
            self.lep_id0.as_str(),
            self.lep_id1.as_str(),
            self.lep_pt0.as_str(),
            self.lep_pt1.as_str(),
            self.lep_eta0.as_str(),
            self.lep_eta1.as_str(),
            self.lep_phi0.as_str(),
            self.lep_phi1.as_str(),
            self.jet_n.as_str(),
            self.met_x.as_str(),
            self.met_y.as_str(),
            self.met.as_str(),
        ]
    }

    /// Extra columns needed when a recoil estimate is requested.
    pub fn recoil_required(&self) -> Vec<&str> {
        vec![
            self.trackmet_x.as_str(),
            self.trackmet_y.as_str(),
            self.vertices.as_str(),
            self.pileup.as_str(),
        ]
    }

    /// Fail with `MissingField` for the first required column absent from
    /// the table.
    pub fn check_columns<F>(&self, has_column: F, recoil: bool) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        let mut required = self.required();
        if recoil {
            required.extend(self.recoil_required());
        }
        match required.into_iter().find(|c| !has_column(c)) {
            Some(missing) => Err(GridError::MissingField(missing.to_string())),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Charge resolution
// ---------------------------------------------------------------------------

/// Resolve a same-sign leading pair by a 50/50 draw.
///
/// Opposite-sign ids are returned unchanged and consume no randomness.
/// For a same-sign pair one lepton becomes positive and the other negative,
/// chosen by `rng`; the magnitudes (flavors) are kept.
pub fn resolve_charge<R: Rng + ?Sized>(id0: i32, id1: i32, rng: &mut R) -> (i32, i32) {
    if id0.signum() * id1.signum() <= 0 {
        return (id0, id1);
    }
    let s = if rng.random::<f64>() >= 0.5 { -1 } else { 1 };
    (s * id0.abs(), -s * id1.abs())
}

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// Four-momenta and identifiers of one event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventRecord {
    pub entry: u64,
    pub event_number: i64,
    pub run_number: i64,
    pub lp: FourMomentum,
    pub lm: FourMomentum,
    pub lp_id: i32,
    pub lm_id: i32,
    /// All jets in the event, leading first.
    pub jets: Vec<FourMomentum>,
    pub met: FourMomentum,
    pub recoil: Option<FourMomentum>,
}

/// Identifiers read before kinematics are built.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventIds {
    pub event_number: i64,
    pub run_number: i64,
}

fn field(row: &RowData, column: &str) -> Result<f64> {
    row.scalar(column)
        .ok_or_else(|| GridError::MissingField(column.to_string()))
}

impl EventSchema {
    /// Event and run numbers; the channel number replaces the run number
    /// when the table carries it.
    pub fn ids(&self, row: &RowData) -> Result<EventIds> {
        let event_number = field(row, &self.event_number)? as i64;
        let mut run_number = field(row, &self.run_number)? as i64;
        if let Some(channel) = &self.channel_number
            && let Some(c) = row.scalar(channel)
        {
            run_number = c as i64;
        }
        Ok(EventIds {
            event_number,
            run_number,
        })
    }

    /// Raw lepton ids as stored.
    pub fn lepton_ids(&self, row: &RowData) -> Result<(i32, i32)> {
        Ok((
            field(row, &self.lep_id0)? as i32,
            field(row, &self.lep_id1)? as i32,
        ))
    }

    /// Build the event's four-momenta given resolved lepton ids.
    ///
    /// A positive id marks the positive lepton. Ids other than electrons
    /// and muons fail with [`GridError::UnsupportedLepton`].
    pub fn build(&self, row: &RowData, entry: u64, ids: (i32, i32)) -> Result<EventRecord> {
        let EventIds {
            event_number,
            run_number,
        } = self.ids(row)?;
        let u = self.unit;

        let lepton = |pt: &str, eta: &str, phi: &str, id: i32| -> Result<FourMomentum> {
            let mass = lepton_mass(id).ok_or(GridError::UnsupportedLepton(id))?;
            Ok(FourMomentum::from_pt_eta_phi_m(
                field(row, pt)? / u,
                field(row, eta)?,
                field(row, phi)?,
                mass,
            ))
        };
        let l0 = lepton(&self.lep_pt0, &self.lep_eta0, &self.lep_phi0, ids.0)?;
        let l1 = lepton(&self.lep_pt1, &self.lep_eta1, &self.lep_phi1, ids.1)?;
        let (lp, lm, lp_id, lm_id) = if ids.0 > 0 {
            (l0, l1, ids.0, ids.1)
        } else {
            (l1, l0, ids.1, ids.0)
        };

        let njets = field(row, &self.jet_n)?.max(0.0) as usize;
        let mut jets = Vec::with_capacity(njets);
        for i in 0..njets {
            let (Some(pt), Some(eta), Some(phi)) = (
                row.element(&self.jet_pt, i),
                row.element(&self.jet_eta, i),
                row.element(&self.jet_phi, i),
            ) else {
                break;
            };
            jets.push(FourMomentum::from_pt_eta_phi_m(pt / u, eta, phi, 0.0));
        }

        let met = FourMomentum::new(
            field(row, &self.met_x)? / u,
            field(row, &self.met_y)? / u,
            0.0,
            field(row, &self.met)? / u,
        );

        Ok(EventRecord {
            entry,
            event_number,
            run_number,
            lp,
            lm,
            lp_id,
            lm_id,
            jets,
            met,
            recoil: None,
        })
    }
}

impl EventRecord {
    pub fn object(&self, id: ObjectId) -> Option<&FourMomentum> {
        match id {
            ObjectId::Lp => Some(&self.lp),
            ObjectId::Lm => Some(&self.lm),
            ObjectId::LeadJet => self.jets.first(),
            ObjectId::SubleadJet => self.jets.get(1),
            ObjectId::Met => Some(&self.met),
            ObjectId::Recoil => self.recoil.as_ref(),
        }
    }

    /// Whether the event carries the jets `topology` needs.
    pub fn fits(&self, topology: Topology) -> bool {
        self.jets.len() >= topology.jets()
    }

    /// Grid query vector for `specs`; `None` if a referenced object is absent.
    pub fn coordinates(&self, specs: &[CoordinateSpec]) -> Option<Vec<f64>> {
        specs
            .iter()
            .map(|s| self.object(s.object).map(|p| s.component.of(p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn event_row() -> RowData {
        RowData::new()
            .with("EventNumber", Value::Scalar(1234.0))
            .with("RunNumber", Value::Scalar(200_000.0))
            .with("lepID0", Value::Scalar(-11.0))
            .with("lepID1", Value::Scalar(13.0))
            .with("lepPt0", Value::Scalar(40_000.0))
            .with("lepPt1", Value::Scalar(25_000.0))
            .with("lepEta0", Value::Scalar(0.5))
            .with("lepEta1", Value::Scalar(-1.0))
            .with("lepPhi0", Value::Scalar(0.1))
            .with("lepPhi1", Value::Scalar(2.0))
            .with("m_jet_n", Value::Scalar(3.0))
            .with("m_jet_pt", Value::Array(vec![60_000.0, 35_000.0, 20_000.0]))
            .with("m_jet_eta", Value::Array(vec![0.2, -2.1, 1.0]))
            .with("m_jet_phi", Value::Array(vec![-1.0, 3.0, 0.0]))
            .with("MET_x", Value::Scalar(10_000.0))
            .with("MET_y", Value::Scalar(-20_000.0))
            .with("MET", Value::Scalar(22_360.68))
    }

    #[test]
    fn test_parse_coordinate_spec() {
        let s = CoordinateSpec::parse("leadj.X()").unwrap();
        assert_eq!(s.object, ObjectId::LeadJet);
        assert_eq!(s.component, Component::Px);
        let s = CoordinateSpec::parse("recoil.phi").unwrap();
        assert_eq!(s.object, ObjectId::Recoil);
        assert!(CoordinateSpec::parse("tau.px").is_err());
        assert!(CoordinateSpec::parse("lp.mass").is_err());
        assert!(CoordinateSpec::parse("lp").is_err());
    }

    #[test]
    fn test_same_sign_resolution_is_seeded_and_opposite() {
        let mut a = SmallRng::seed_from_u64(7);
        let mut b = SmallRng::seed_from_u64(7);
        for _ in 0..20 {
            let ra = resolve_charge(11, 13, &mut a);
            let rb = resolve_charge(11, 13, &mut b);
            assert_eq!(ra, rb);
            assert_eq!(ra.0.signum(), -ra.1.signum());
            assert_eq!((ra.0.abs(), ra.1.abs()), (11, 13));
        }
    }

    #[test]
    fn test_same_sign_resolution_draws_both_ways() {
        let mut rng = SmallRng::seed_from_u64(42);
        let draws: Vec<i32> = (0..200)
            .map(|_| resolve_charge(-13, -13, &mut rng).0.signum())
            .collect();
        assert!(draws.contains(&1) && draws.contains(&-1));
    }

    #[test]
    fn test_opposite_sign_untouched() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(resolve_charge(-11, 13, &mut rng), (-11, 13));
        assert_eq!(resolve_charge(13, -13, &mut rng), (13, -13));
    }

    #[test]
    fn test_build_event() {
        let schema = EventSchema::default();
        let row = event_row();
        let ids = schema.lepton_ids(&row).unwrap();
        let ev = schema.build(&row, 5, ids).unwrap();

        assert_eq!(ev.entry, 5);
        assert_eq!(ev.event_number, 1234);
        assert_eq!(ev.run_number, 200_000);
        // lepton 1 carries the positive id
        assert!((ev.lp.pt() - 25.0).abs() < 1e-9);
        assert!((ev.lm.pt() - 40.0).abs() < 1e-9);
        assert_eq!((ev.lp_id, ev.lm_id), (13, -11));
        assert_eq!(ev.jets.len(), 3);
        assert!((ev.jets[0].pt() - 60.0).abs() < 1e-9);
        assert!((ev.met.px - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_tau_lepton_rejected() {
        let schema = EventSchema::default();
        let row = event_row().with("lepID1", Value::Scalar(-15.0));
        let ids = schema.lepton_ids(&row).unwrap();
        assert_eq!(schema.build(&row, 0, ids), Err(GridError::UnsupportedLepton(-15)));
    }

    #[test]
    fn test_channel_number_overrides_run() {
        let schema = EventSchema::default();
        let row = event_row().with("mc_channel_number", Value::Scalar(161_005.0));
        assert_eq!(schema.ids(&row).unwrap().run_number, 161_005);
    }

    #[test]
    fn test_missing_required_column() {
        let schema = EventSchema::default();
        let row = event_row();
        let err = schema.check_columns(|c| row.has(c) && c != "MET", false).unwrap_err();
        assert_eq!(err, GridError::MissingField("MET".into()));
        assert!(schema.check_columns(|c| row.has(c), false).is_ok());
        assert!(matches!(
            schema.check_columns(|c| row.has(c), true),
            Err(GridError::MissingField(_))
        ));
    }

    #[test]
    fn test_coordinates_and_topology() {
        let schema = EventSchema::default();
        let row = event_row();
        let ev = schema.build(&row, 0, (-11, 13)).unwrap();
        assert!(ev.fits(Topology::TwoJet));

        let specs = CoordinateSpec::parse_all(&[
            "lp.px".to_string(),
            "subleadj.pz".to_string(),
            "met.pt".to_string(),
        ])
        .unwrap();
        let v = ev.coordinates(&specs).unwrap();
        assert_eq!(v.len(), 3);
        assert!((v[0] - ev.lp.px).abs() < 1e-12);
        assert!((v[1] - ev.jets[1].pz).abs() < 1e-12);

        let recoil = CoordinateSpec::parse_all(&["recoil.px".to_string()]).unwrap();
        assert!(ev.coordinates(&recoil).is_none());
    }

    #[test]
    fn test_insufficient_jets() {
        let schema = EventSchema::default();
        let row = event_row().with("m_jet_n", Value::Scalar(1.0));
        let ev = schema.build(&row, 0, (-11, 13)).unwrap();
        assert!(ev.fits(Topology::OneJet));
        assert!(!ev.fits(Topology::TwoJet));
    }
}
