use std::collections::BTreeSet;
use std::str::FromStr;

use rand::seq::index;
use rand::Rng;

/// A range of diary pages and how many of them to draw
///
/// `end = None` means the zone runs up to the maximum page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleZone {
    pub start: u32,
    pub end: Option<u32>,
    pub samples: usize,
}

impl SampleZone {
    pub fn new(start: u32, end: Option<u32>, samples: usize) -> Self {
        Self {
            start,
            end,
            samples,
        }
    }

    /// Recent pages weigh more: 2 of [1,5], 3 of [6,30], 1 of the rest
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(1, Some(5), 2),
            Self::new(6, Some(30), 3),
            Self::new(31, None, 1),
        ]
    }

    /// Parses `1-5:2,6-30:3,31-:1`
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect()
    }

    /// The zone's pages once clipped to `max_page`; `None` if nothing is left
    fn bounds(&self, max_page: u32) -> Option<(u32, u32)> {
        let start = self.start.max(1);
        let end = self.end.unwrap_or(max_page).min(max_page);
        (start <= end).then_some((start, end))
    }
}

impl FromStr for SampleZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (range, samples) = s
            .split_once(':')
            .ok_or_else(|| format!("zone '{}' is missing ':<samples>'", s))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| format!("zone '{}' is missing '-'", s))?;

        let start: u32 = start
            .trim()
            .parse()
            .map_err(|_| format!("zone '{}' has an invalid start page", s))?;
        let end = match end.trim() {
            "" => None,
            end => Some(
                end.parse::<u32>()
                    .map_err(|_| format!("zone '{}' has an invalid end page", s))?,
            ),
        };
        let samples = samples
            .trim()
            .parse()
            .map_err(|_| format!("zone '{}' has an invalid sample count", s))?;

        if start == 0 || end.is_some_and(|e| e < start) {
            return Err(format!("zone '{}' is empty", s));
        }

        Ok(Self::new(start, end, samples))
    }
}

/// Chooses which diary pages of one user to crawl
///
/// The number of pages drawn is bounded by the zone sample counts, whatever
/// the length of the user's history.
#[derive(Debug, Clone)]
pub struct PageSampler {
    zones: Vec<SampleZone>,
    max_page: u32,
}

impl PageSampler {
    pub fn new(zones: Vec<SampleZone>, max_page: u32) -> Self {
        Self { zones, max_page }
    }

    /// Distinct page numbers in ascending order
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<u32> {
        let mut pages = BTreeSet::new();

        for zone in &self.zones {
            let Some((start, end)) = zone.bounds(self.max_page) else {
                continue;
            };
            let available = (end - start + 1) as usize;
            let amount = zone.samples.min(available);

            for offset in index::sample(rng, available, amount) {
                pages.insert(start + offset as u32);
            }
        }

        pages.into_iter().collect()
    }

    pub fn sample(&self) -> Vec<u32> {
        self.sample_with(&mut rand::thread_rng())
    }
}
