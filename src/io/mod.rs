use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::geo::{BoundingBox, LatLon, check_latitude, check_lonlat};

/// Transmitter CSV files must have these header columns.
pub const REQUIRED_TRANSMITTER_FIELDS: [&str; 8] = [
    "network_name",
    "site_name",
    "latitude",
    "longitude",
    "antenna_height",
    "polarization",
    "frequency",
    "power_eirp",
];

/// Range the Longley-Rice model is defined for.
const ITM_FREQUENCY_RANGE_MHZ: std::ops::RangeInclusive<f64> = 20.0..=20_000.0;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("line {line}: missing required field `{field}`")]
    MissingField { field: String, line: u64 },
    #[error("line {line}: invalid value {value:?} for `{field}`: {reason}")]
    InvalidFieldValue {
        field: String,
        line: u64,
        value: String,
        reason: String,
    },
    #[error("line {line}: duplicate transmitter {key}")]
    DuplicateTransmitter { key: TransmitterKey, line: u64 },
    #[error("failed to read transmitters: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarization {
    Horizontal, // 0
    Vertical,   // 1
}

impl Polarization {
    pub fn code(self) -> u8 {
        match self {
            Polarization::Horizontal => 0,
            Polarization::Vertical => 1,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "0" | "h" | "horizontal" => Some(Polarization::Horizontal),
            "1" | "v" | "vertical" => Some(Polarization::Vertical),
            _ => None,
        }
    }
}

/// Stable identity of a transmitter: network name, then site name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransmitterKey {
    pub network_name: String,
    pub site_name: String,
}

impl TransmitterKey {
    pub fn new(network_name: impl Into<String>, site_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            site_name: site_name.into(),
        }
    }

    /// File name stem with whitespace stripped, e.g. `TriState_MountAiry`.
    pub fn file_stem(&self) -> String {
        let squash = |s: &str| s.split_whitespace().collect::<String>();
        format!("{}_{}", squash(&self.network_name), squash(&self.site_name))
    }
}

impl fmt::Display for TransmitterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_name, self.site_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmitter {
    pub key: TransmitterKey,
    pub latitude: f64,
    pub longitude: f64,
    pub antenna_height_m: f64, // above ground
    pub polarization: Polarization,
    pub frequency_mhz: f64,
    pub power_eirp_w: f64,
}

impl Transmitter {
    pub fn location(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }

    pub fn eirp_dbm(&self) -> f64 {
        10.0 * (self.power_eirp_w * 1000.0).log10()
    }
}

/// Validated transmitters of one input file, keyed by network and site.
#[derive(Debug, Clone, Default)]
pub struct TransmitterRegistry {
    transmitters: BTreeMap<TransmitterKey, Transmitter>,
}

impl TransmitterRegistry {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_path(path)?;
        let registry = Self::from_csv(reader)?;
        info!(path = %path.display(), count = registry.len(), "Loaded transmitters");
        Ok(registry)
    }

    pub fn from_reader<R: std::io::Read>(rdr: R) -> Result<Self, RegistryError> {
        let reader = csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(rdr);
        Self::from_csv(reader)
    }

    fn from_csv<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, RegistryError> {
        let headers = reader.headers()?.clone();
        let mut columns = [0usize; REQUIRED_TRANSMITTER_FIELDS.len()];
        for (slot, field) in columns.iter_mut().zip(REQUIRED_TRANSMITTER_FIELDS) {
            *slot = headers
                .iter()
                .position(|h| h == field)
                .ok_or_else(|| RegistryError::MissingField {
                    field: field.to_string(),
                    line: 1,
                })?;
        }

        let mut transmitters = BTreeMap::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let row = Row {
                record: &record,
                columns: &columns,
                line,
            };
            let tx = row.parse()?;
            if transmitters.contains_key(&tx.key) {
                return Err(RegistryError::DuplicateTransmitter { key: tx.key, line });
            }
            transmitters.insert(tx.key.clone(), tx);
        }

        Ok(Self { transmitters })
    }

    /// Registry built from already validated transmitters.
    pub fn from_transmitters<I: IntoIterator<Item = Transmitter>>(items: I) -> Result<Self, RegistryError> {
        let mut transmitters = BTreeMap::new();
        for (i, tx) in items.into_iter().enumerate() {
            if transmitters.contains_key(&tx.key) {
                return Err(RegistryError::DuplicateTransmitter {
                    key: tx.key,
                    line: i as u64 + 2,
                });
            }
            transmitters.insert(tx.key.clone(), tx);
        }
        Ok(Self { transmitters })
    }

    pub fn get(&self, key: &TransmitterKey) -> Option<&Transmitter> {
        self.transmitters.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transmitter> {
        self.transmitters.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TransmitterKey> {
        self.transmitters.keys()
    }

    pub fn len(&self) -> usize {
        self.transmitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transmitters.is_empty()
    }

    /// Box around every transmitter location.
    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::of_points(self.iter().map(Transmitter::location))
    }
}

struct Row<'a> {
    record: &'a csv::StringRecord,
    columns: &'a [usize; REQUIRED_TRANSMITTER_FIELDS.len()],
    line: u64,
}

impl Row<'_> {
    fn field(&self, idx: usize) -> Result<&str, RegistryError> {
        let name = REQUIRED_TRANSMITTER_FIELDS[idx];
        match self.record.get(self.columns[idx]) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(RegistryError::MissingField {
                field: name.to_string(),
                line: self.line,
            }),
        }
    }

    fn invalid(&self, idx: usize, value: &str, reason: impl Into<String>) -> RegistryError {
        RegistryError::InvalidFieldValue {
            field: REQUIRED_TRANSMITTER_FIELDS[idx].to_string(),
            line: self.line,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn number(&self, idx: usize) -> Result<f64, RegistryError> {
        let raw = self.field(idx)?;
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            Ok(_) => Err(self.invalid(idx, raw, "not a finite number")),
            Err(e) => Err(self.invalid(idx, raw, e.to_string())),
        }
    }

    fn positive(&self, idx: usize) -> Result<f64, RegistryError> {
        let v = self.number(idx)?;
        if v <= 0.0 {
            return Err(self.invalid(idx, self.field(idx)?, "must be greater than zero"));
        }
        Ok(v)
    }

    fn parse(&self) -> Result<Transmitter, RegistryError> {
        // Every required cell must be present before any value is judged.
        for idx in 0..REQUIRED_TRANSMITTER_FIELDS.len() {
            self.field(idx)?;
        }

        let network_name = self.field(0)?.to_string();
        let site_name = self.field(1)?.to_string();

        let latitude = self.number(2)?;
        let longitude = self.number(3)?;
        if let Err(e) = check_latitude(latitude) {
            return Err(self.invalid(2, self.field(2)?, e.to_string()));
        }
        if let Err(e) = check_lonlat(longitude, latitude) {
            return Err(self.invalid(3, self.field(3)?, e.to_string()));
        }

        let antenna_height_m = self.number(4)?;
        if antenna_height_m < 0.0 {
            return Err(self.invalid(4, self.field(4)?, "must not be negative"));
        }

        let raw_pol = self.field(5)?;
        let polarization =
            Polarization::parse(raw_pol).ok_or_else(|| self.invalid(5, raw_pol, "expected 0 (horizontal) or 1 (vertical)"))?;

        let frequency_mhz = self.positive(6)?;
        let power_eirp_w = self.positive(7)?;

        let key = TransmitterKey::new(network_name, site_name);
        if !ITM_FREQUENCY_RANGE_MHZ.contains(&frequency_mhz) {
            warn!(transmitter = %key, frequency_mhz, "Frequency outside the 20 MHz - 20 GHz model range");
        }

        Ok(Transmitter {
            key,
            latitude,
            longitude,
            antenna_height_m,
            polarization,
            frequency_mhz,
            power_eirp_w,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "network_name,site_name,latitude,longitude,antenna_height,polarization,frequency,power_eirp";

    fn load(body: &str) -> Result<TransmitterRegistry, RegistryError> {
        TransmitterRegistry::from_reader(format!("{HEADER}\n{body}").as_bytes())
    }

    #[test]
    fn test_parses_valid_rows() {
        let reg = load(
            "Tri State,Mount Airy,39.37,-77.15,120,1,615,100000\n\
             Tri State,Bel Air,39.53,-76.35,80.5,h,527,50000\n",
        )
        .unwrap();
        assert_eq!(reg.len(), 2);
        let keys: Vec<_> = reg.keys().map(|k| k.site_name.as_str()).collect();
        assert_eq!(keys, vec!["Bel Air", "Mount Airy"]);
        let tx = reg.get(&TransmitterKey::new("Tri State", "Mount Airy")).unwrap();
        assert_eq!(tx.polarization, Polarization::Vertical);
        assert_eq!(tx.frequency_mhz, 615.0);
        assert_eq!(tx.key.file_stem(), "TriState_MountAiry");
        let b = reg.bounds().unwrap();
        assert_eq!((b.west, b.north), (-77.15, 39.53));
    }

    #[test]
    fn test_missing_frequency_value() {
        let err = load(
            "net,a,39.0,-76.0,10,0,600,100\n\
             net,b,39.1,-76.1,10,0,,100\n",
        )
        .unwrap_err();
        match err {
            RegistryError::MissingField { field, line } => {
                assert_eq!(field, "frequency");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_short_row_is_missing_field() {
        let err = load("net,a,39.0,-76.0,10,0\n").unwrap_err();
        assert!(matches!(err, RegistryError::MissingField { ref field, line: 2 } if field == "frequency"));
    }

    #[test]
    fn test_missing_column() {
        let csv = "network_name,site_name,latitude,longitude,antenna_height,polarization,power_eirp\n\
                   net,a,39.0,-76.0,10,0,100\n";
        let err = TransmitterRegistry::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, RegistryError::MissingField { ref field, line: 1 } if field == "frequency"));
    }

    #[test]
    fn test_duplicate_transmitter() {
        let err = load(
            "net,a,39.0,-76.0,10,0,600,100\n\
             net,a,38.0,-75.0,10,0,600,100\n",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTransmitter { line: 3, .. }));
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ("net,a,95.0,-76.0,10,0,600,100", "latitude"),
            ("net,a,39.0,-190.0,10,0,600,100", "longitude"),
            ("net,a,39.0,-76.0,-1,0,600,100", "antenna_height"),
            ("net,a,39.0,-76.0,10,2,600,100", "polarization"),
            ("net,a,39.0,-76.0,10,0,0,100", "frequency"),
            ("net,a,39.0,-76.0,10,0,600,abc", "power_eirp"),
            ("net,a,NaN,-76.0,10,0,600,100", "latitude"),
        ];
        for (row, expected) in cases {
            match load(row).unwrap_err() {
                RegistryError::InvalidFieldValue { field, line, .. } => {
                    assert_eq!(field, expected, "{row}");
                    assert_eq!(line, 2);
                }
                other => panic!("{row}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_first_error_wins() {
        // the bad value on line 2 is reported even though line 3 is a duplicate
        let err = load(
            "net,a,39.0,-76.0,10,0,-5,100\n\
             net,a,39.0,-76.0,10,0,600,100\n",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidFieldValue { line: 2, .. }));
    }

    #[test]
    fn test_extra_columns_ignored() {
        let csv = "bearing,power_eirp,frequency,polarization,antenna_height,longitude,latitude,site_name,network_name\n\
                   90,100,600,v,10,-76.0,39.0,a,net\n";
        let reg = TransmitterRegistry::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(reg.len(), 1);
    }
}
