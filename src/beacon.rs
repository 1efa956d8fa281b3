//! Candidate filtering with radio beacon signal strengths.
//!
//! A beacon signature is a vector with one entry per known beacon, holding the
//! normalized signal strength or zero when the beacon was not heard. Views are
//! compared with the query by co-occurrence (how much of the signal mass both
//! share) and by the mean strength difference over beacons both have heard.

use crate::error::ParseError;
use crate::map::ViewId;
use crate::settings::LocalizeSettings;
use float_ord::FloatOrd;
use log::*;
use std::collections::HashMap;
use std::str::FromStr;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The value a normalized signature is scaled to.
pub const NORMALIZED_STRENGTH: f32 = 100.0;

/// Offset added to raw RSSI readings (negative dBm) to make them positive.
pub const RSSI_OFFSET: f32 = 100.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum BeaconNormalization {
    /// Scale so the strongest signal becomes 100.
    Max,
    /// Scale so the median of the heard signals becomes 100.
    Median,
}

/// Normalizes a signature in place. All-zero signatures are left untouched.
pub fn normalize(signature: &mut [f32], method: BeaconNormalization) {
    let reference = match method {
        BeaconNormalization::Max => signature
            .iter()
            .copied()
            .max_by_key(|&v| FloatOrd(v))
            .unwrap_or(0.0),
        BeaconNormalization::Median => {
            let mut heard: Vec<f32> = signature.iter().copied().filter(|&v| v != 0.0).collect();
            if heard.is_empty() {
                return;
            }
            heard.sort_unstable_by_key(|&v| FloatOrd(v));
            heard[heard.len() / 2]
        }
    };
    if reference != 0.0 {
        signature
            .iter_mut()
            .for_each(|v| *v = NORMALIZED_STRENGTH * *v / reference);
    }
}

/// The ratio of shared to total signal over beacons above `threshold` in either signature.
pub fn cooccurrence(a: &[f32], b: &[f32], threshold: f32) -> f32 {
    let (shared, total) = a
        .iter()
        .zip(b)
        .filter(|(&a, &b)| a > threshold || b > threshold)
        .fold((0.0, 0.0), |(shared, total), (&a, &b)| {
            (shared + a.min(b), total + a.max(b))
        });
    if total > 0.0 {
        shared / total
    } else {
        0.0
    }
}

/// The mean absolute strength difference over beacons heard in both signatures.
///
/// Returns infinity unless at least `min_same` beacons were heard by both.
pub fn signal_distance(a: &[f32], b: &[f32], min_same: usize) -> f32 {
    let (count, sum) = a
        .iter()
        .zip(b)
        .filter(|(&a, &b)| a > 0.0 && b > 0.0)
        .fold((0usize, 0.0f32), |(count, sum), (&a, &b)| {
            (count + 1, sum + (a - b).abs())
        });
    if count == 0 || count < min_same {
        f32::INFINITY
    } else {
        sum / count as f32
    }
}

/// The comparison of a view signature against the query signature.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BeaconScore {
    pub accept: bool,
    pub distance: f32,
}

/// Scores a view. Only views with a pose and enough co-occurrence are accepted.
pub fn score_view(
    query: &[f32],
    view: &[f32],
    has_pose: bool,
    settings: &LocalizeSettings,
) -> BeaconScore {
    let accept = has_pose
        && cooccurrence(query, view, settings.beacon_cooccurrence_threshold)
            > settings.beacon_cooccurrence_ratio;
    let distance = if accept {
        signal_distance(query, view, settings.beacon_min_same)
    } else {
        f32::INFINITY
    };
    BeaconScore { accept, distance }
}

/// Selects up to `knn` views by ascending distance, taking every `skip`-th view.
///
/// `scored` holds every view under consideration, including rejected ones with an
/// infinite distance. The skip shrinks towards 1 while `skip * knn` exceeds the
/// number of views. Views with an infinite distance are never selected.
pub fn select_views(scored: &[(ViewId, f32)], knn: usize, skip: usize) -> Vec<ViewId> {
    let mut ranked = scored.to_vec();
    ranked.sort_by_key(|&(id, distance)| (FloatOrd(distance), id));

    let rows = ranked.len();
    let mut skip = skip.max(1);
    while skip * knn > rows {
        skip -= 1;
        if skip == 0 {
            skip = 1;
            break;
        }
    }

    ranked[..(skip * knn).min(rows)]
        .iter()
        .step_by(skip)
        .filter(|(_, distance)| distance.is_finite())
        .map(|&(id, _)| id)
        .collect()
}

/// The known beacons and the signatures recorded at each map view.
#[derive(Debug, Clone, Default)]
pub struct BeaconTable {
    beacons: Vec<(u16, u16)>,
    index: HashMap<(u16, u16), usize>,
    signatures: HashMap<ViewId, Vec<f32>>,
}

impl BeaconTable {
    pub fn new(beacons: Vec<(u16, u16)>) -> Self {
        let index = beacons
            .iter()
            .enumerate()
            .map(|(ix, &beacon)| (beacon, ix))
            .collect();
        Self {
            beacons,
            index,
            signatures: HashMap::new(),
        }
    }

    /// Parses the text table format:
    ///
    /// ```text
    /// <beacon count>
    /// <major> <minor>        (one line per beacon)
    /// <view count>
    /// <view id> <rssi> ...   (one value per beacon)
    /// ```
    ///
    /// Signatures are normalized with `method` as they are loaded.
    pub fn parse(text: &str, method: BeaconNormalization) -> Result<Self, ParseError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(ix, line)| (ix + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());
        let mut next_line = |what: &str| {
            lines
                .next()
                .ok_or_else(|| ParseError::new(0, format!("missing {}", what)))
        };

        let (line, count) = next_line("beacon count")?;
        let count: usize = parse_field(count, line)?;
        let mut beacons = Vec::new();
        for _ in 0..count {
            let (line, text) = next_line("beacon")?;
            let mut fields = text.split_whitespace();
            let major = parse_field(fields.next().unwrap_or(""), line)?;
            let minor = parse_field(fields.next().unwrap_or(""), line)?;
            beacons.push((major, minor));
        }
        let mut table = Self::new(beacons);

        let (line, rows) = next_line("view count")?;
        let rows: usize = parse_field(rows, line)?;
        for _ in 0..rows {
            let (line, text) = next_line("view signature")?;
            let mut fields = text.split_whitespace();
            let view = ViewId(parse_field(fields.next().unwrap_or(""), line)?);
            let mut signature = fields
                .map(|field| parse_field::<f32>(field, line))
                .collect::<Result<Vec<f32>, _>>()?;
            if signature.len() != table.len() {
                return Err(ParseError::new(
                    line,
                    format!("expected {} values, found {}", table.len(), signature.len()),
                ));
            }
            normalize(&mut signature, method);
            table.signatures.insert(view, signature);
        }
        info!(
            "loaded {} beacons with {} view signatures",
            table.len(),
            table.signatures.len()
        );
        Ok(table)
    }

    /// Parses one beacon reading line into a normalized signature.
    ///
    /// The line holds a timestamp, the word `Beacon`, four ignored fields, the number
    /// of signals, and then `major minor rssi` for each signal. Signals with a zero
    /// RSSI and beacons missing from the table are ignored.
    pub fn parse_reading(
        &self,
        line: &str,
        method: BeaconNormalization,
    ) -> Result<Vec<f32>, ParseError> {
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|field| !field.is_empty())
            .collect();
        if fields.get(1) != Some(&"Beacon") {
            return Err(ParseError::new(1, "not a beacon reading"));
        }
        let count: usize = parse_field(fields.get(6).copied().unwrap_or(""), 1)?;
        let signals = &fields[7.min(fields.len())..];
        if count.checked_mul(3).map_or(true, |needed| signals.len() < needed) {
            return Err(ParseError::new(
                1,
                format!("expected {} signals, found {}", count, signals.len() / 3),
            ));
        }

        let mut signature = vec![0.0; self.len()];
        for signal in signals.chunks_exact(3).take(count) {
            let major: u16 = parse_field(signal[0], 1)?;
            let minor: u16 = parse_field(signal[1], 1)?;
            let rssi: f32 = parse_field(signal[2], 1)?;
            if rssi == 0.0 {
                continue;
            }
            match self.index.get(&(major, minor)) {
                Some(&ix) => signature[ix] = rssi + RSSI_OFFSET,
                None => trace!("ignoring unknown beacon {} {}", major, minor),
            }
        }
        normalize(&mut signature, method);
        Ok(signature)
    }

    /// The number of known beacons.
    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    pub fn beacons(&self) -> &[(u16, u16)] {
        &self.beacons
    }

    pub fn insert_signature(&mut self, view: ViewId, signature: Vec<f32>) {
        self.signatures.insert(view, signature);
    }

    pub fn signature(&self, view: ViewId) -> Option<&[f32]> {
        self.signatures.get(&view).map(Vec::as_slice)
    }
}

fn parse_field<T: FromStr>(field: &str, line: usize) -> Result<T, ParseError> {
    field
        .parse()
        .map_err(|_| ParseError::new(line, format!("invalid field {:?}", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn max_normalization() {
        let mut v = vec![0.0, 20.0, 40.0, 10.0];
        normalize(&mut v, BeaconNormalization::Max);
        assert_eq!(v, vec![0.0, 50.0, 100.0, 25.0]);

        let mut zero = vec![0.0; 4];
        normalize(&mut zero, BeaconNormalization::Max);
        assert_eq!(zero, vec![0.0; 4]);
    }

    #[test]
    fn median_normalization() {
        // Heard values sorted are 10, 20, 40, so the median is 20.
        let mut v = vec![0.0, 40.0, 0.0, 10.0, 20.0];
        normalize(&mut v, BeaconNormalization::Median);
        assert_eq!(v, vec![0.0, 200.0, 0.0, 50.0, 100.0]);

        let mut zero = vec![0.0; 3];
        normalize(&mut zero, BeaconNormalization::Median);
        assert_eq!(zero, vec![0.0; 3]);
    }

    #[test]
    fn cooccurrence_over_active_beacons() {
        let a = [50.0, 5.0, 0.0, 100.0];
        let b = [30.0, 0.0, 8.0, 100.0];
        // Only the first and last entries exceed the threshold in either signature.
        assert_relative_eq!(cooccurrence(&a, &b, 10.0), 130.0 / 150.0);
        assert_eq!(cooccurrence(&[1.0, 2.0], &[3.0, 4.0], 10.0), 0.0);
    }

    #[test]
    fn distance_requires_shared_beacons() {
        let a = [50.0, 0.0, 20.0, 100.0];
        let b = [30.0, 10.0, 0.0, 90.0];
        assert_relative_eq!(signal_distance(&a, &b, 2), 15.0);
        assert_eq!(signal_distance(&a, &b, 3), f32::INFINITY);
        assert_eq!(signal_distance(&[0.0], &[0.0], 0), f32::INFINITY);
    }

    #[test]
    fn weak_signals_count_as_heard() {
        // Median scaling can leave heard beacons below one.
        let a = [0.5, 0.25, 100.0];
        let b = [0.75, 0.5, 100.0];
        assert_relative_eq!(signal_distance(&a, &b, 3), 0.5 / 3.0);
    }

    #[test]
    fn unposed_views_are_rejected() {
        let settings = LocalizeSettings::default();
        let a = [100.0, 50.0, 80.0];
        assert!(score_view(&a, &a, true, &settings).accept);
        let score = score_view(&a, &a, false, &settings);
        assert!(!score.accept);
        assert_eq!(score.distance, f32::INFINITY);
    }

    #[test]
    fn decimated_selection() {
        let distances = [7.0, 3.0, 9.0, 1.0, 4.0, 8.0, 2.0, 6.0, 5.0, 10.0];
        let scored: Vec<(ViewId, f32)> = distances
            .iter()
            .enumerate()
            .map(|(ix, &d)| (ViewId(ix as u32), d))
            .collect();
        // Ranking by distance is views 3, 6, 1, 4, 8, 7, 0, 5, 2, 9.
        assert_eq!(
            select_views(&scored, 3, 2),
            vec![ViewId(3), ViewId(1), ViewId(8)]
        );
        // Skip shrinks to 2 because 3 * 4 > 10.
        assert_eq!(
            select_views(&scored, 4, 3),
            vec![ViewId(3), ViewId(1), ViewId(8), ViewId(0)]
        );
        assert_eq!(select_views(&scored, 20, 1).len(), 10);
    }

    #[test]
    fn infinite_distances_are_not_selected() {
        let scored = vec![
            (ViewId(0), f32::INFINITY),
            (ViewId(1), 2.0),
            (ViewId(2), f32::INFINITY),
        ];
        assert_eq!(select_views(&scored, 2, 1), vec![ViewId(1)]);
    }

    #[test]
    fn table_and_reading() {
        let text = "3\n1 10\n1 11\n2 10\n2\n0 40 20 0\n5 0 30 10\n";
        let table = BeaconTable::parse(text, BeaconNormalization::Max).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.beacons()[2], (2, 10));
        assert_eq!(table.signature(ViewId(0)).unwrap().len(), 3);
        assert!(table.signature(ViewId(5)).is_some());
        assert!(table.signature(ViewId(1)).is_none());

        let reading = table
            .parse_reading(
                "1500000000 Beacon a b c d 3 1 11 -50 7 7 -40 2 10 -75",
                BeaconNormalization::Max,
            )
            .unwrap();
        // Strengths become 50 and 25 before scaling; the unknown beacon is ignored.
        assert_eq!(reading, vec![0.0, 100.0, 50.0]);
    }

    #[test]
    fn malformed_table() {
        let err = BeaconTable::parse("2\n1 10\n1 x\n", BeaconNormalization::Max).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(BeaconTable::parse("1\n1 10\n1\n0 1 2\n", BeaconNormalization::Max).is_err());
    }

    #[test]
    fn huge_counts_are_errors() {
        let err = BeaconTable::parse("18446744073709551615\n1 1\n", BeaconNormalization::Max)
            .unwrap_err();
        assert!(err.reason.contains("missing beacon"));

        let table = BeaconTable::new(vec![(1, 1)]);
        assert!(table
            .parse_reading(
                "1 Beacon a b c d 6148914691236517206 1 1 -50",
                BeaconNormalization::Max
            )
            .is_err());
        assert!(table
            .parse_reading(
                "1 Beacon a b c d 18446744073709551615 1 1 -50",
                BeaconNormalization::Max
            )
            .is_err());
    }
}
