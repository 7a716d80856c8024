// SPDX-License-Identifier: MPL-2.0

use std::path::Path;

use notify::{
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use sctk::reexports::calloop::{LoopHandle, RegistrationToken, channel};

use crate::{
    CosmicBgVideo,
    catalog::{MANIFEST_NAME, is_video_file},
};

/// Rescans the catalog on the control thread when its directory changes.
///
/// Dropping it stops the watcher and unregisters the channel.
pub struct CatalogWatch {
    _watcher: RecommendedWatcher,
    token: RegistrationToken,
    handle: LoopHandle<'static, CosmicBgVideo>,
}

impl Drop for CatalogWatch {
    fn drop(&mut self) {
        self.handle.remove(self.token);
    }
}

impl CatalogWatch {
    pub fn new(handle: &LoopHandle<'static, CosmicBgVideo>, root: &Path) -> eyre::Result<Self> {
        let (notify_tx, notify_rx) = channel::sync_channel(20);

        let token = handle
            .insert_source(
                notify_rx,
                |event: channel::Event<notify::Event>, _, state: &mut CosmicBgVideo| match event {
                    channel::Event::Msg(event) => {
                        if needs_rescan(&event) {
                            tracing::debug!(paths = ?event.paths, "catalog changed");
                            state.session.catalog_mut().rescan();
                        }
                    }
                    channel::Event::Closed => {
                        tracing::debug!("catalog watcher closed");
                    }
                },
            )
            .map_err(|err| eyre::eyre!("{}", err))?;

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .and_then(|mut watcher| {
            watcher.watch(root, RecursiveMode::Recursive)?;
            Ok(watcher)
        });

        let watcher = match watcher {
            Ok(watcher) => watcher,
            Err(why) => {
                handle.remove(token);
                return Err(eyre::eyre!("failed to watch {}: {why}", root.display()));
            }
        };

        tracing::debug!(root = %root.display(), "watching catalog");

        Ok(Self {
            _watcher: watcher,
            token,
            handle: handle.clone(),
        })
    }
}

/// Whether `event` can change the asset listing.
fn needs_rescan(event: &notify::Event) -> bool {
    let relevant = event.paths.iter().any(|path| {
        is_video_file(path) || path.file_name().is_some_and(|name| name == MANIFEST_NAME)
    });

    let manifest_edited = event
        .paths
        .iter()
        .any(|path| path.file_name().is_some_and(|name| name == MANIFEST_NAME));

    match event.kind {
        EventKind::Create(_)
        | EventKind::Remove(_)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::From | RenameMode::Both)) => {
            relevant
        }
        EventKind::Modify(ModifyKind::Data(_)) => manifest_edited,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use notify::event::{CreateKind, DataChange, RemoveKind};

    use super::*;

    #[test]
    fn only_catalog_changes_trigger_rescan() {
        let created = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/v/sea.mp4".into());
        assert!(needs_rescan(&created));

        let removed = notify::Event::new(EventKind::Remove(RemoveKind::File)).add_path("/v/sea.webm".into());
        assert!(needs_rescan(&removed));

        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path("/v/clip.mkv".into());
        assert!(needs_rescan(&renamed));

        let image = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/v/sea.jpg".into());
        assert!(!needs_rescan(&image));

        let written = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/v/sea.mp4".into());
        assert!(!needs_rescan(&written));

        let manifest = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(format!("/v/{MANIFEST_NAME}").into());
        assert!(needs_rescan(&manifest));
    }
}
