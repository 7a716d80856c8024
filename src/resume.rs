// SPDX-License-Identifier: MPL-2.0

//! Which asset to play after a disruption.

use rand::seq::IndexedRandom;

use crate::{
    catalog::{Asset, Catalog},
    scheduler::Scheduler,
    session::{Session, SessionEvent},
    topology::Topology,
    validate::MediaProbe,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumption {
    /// A play request that arrived while the session was paused.
    Pending(Asset),
    Current(Asset),
    Random(Asset),
    /// The catalog is empty.
    Nothing,
}

/// Pick the asset to resume with. A pending request is consumed.
pub fn select(
    pending: &mut Option<Asset>,
    current: Option<&Asset>,
    catalog: &mut impl Catalog,
) -> Resumption {
    if let Some(asset) = pending.take() {
        return Resumption::Pending(asset);
    }

    if let Some(asset) = current {
        return Resumption::Current(asset.clone());
    }

    catalog
        .random_asset()
        .map_or(Resumption::Nothing, Resumption::Random)
}

/// A random replacement for an asset that failed, preferring any other asset.
pub fn fallback(catalog: &mut impl Catalog, failed: &Asset) -> Option<Asset> {
    let others: Vec<Asset> = catalog
        .list_assets()
        .into_iter()
        .filter(|asset| asset.id != failed.id)
        .collect();

    match others.choose(&mut rand::rng()) {
        Some(asset) => Some(asset.clone()),
        None => catalog.random_asset(),
    }
}

impl<T, S, C, P> Session<T, S, C, P>
where
    T: Topology,
    S: Scheduler,
    C: Catalog,
    P: MediaProbe,
{
    /// Runs once after every recreation that produced surfaces.
    pub(crate) fn resume_after_recreation(&mut self) {
        match select(&mut self.pending, self.current.as_ref(), &mut self.catalog) {
            Resumption::Pending(asset) => {
                tracing::info!(asset = %asset.id, "resuming with pending request");
                self.start_playback(asset);
            }
            Resumption::Current(asset) => {
                tracing::info!(asset = %asset.id, "resuming current asset");
                self.start_playback(asset);
            }
            Resumption::Random(asset) => {
                tracing::info!(asset = %asset.id, "resuming with random asset");
                self.catalog.record_played(&asset);
                self.start_playback(asset);
            }
            Resumption::Nothing => {
                tracing::info!("catalog is empty, nothing to resume");
                self.emit(SessionEvent::NowPlaying(None));
            }
        }
    }
}
