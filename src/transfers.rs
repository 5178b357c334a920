use crate::action::Action;
use crate::error::BuildError;
use crate::image::{COPY_KEY, ZERO_KEY};
use crate::image::Image;

/// Classifies every target file-map entry into a ZERO/NEW/MOVE/DIFF action,
/// comparing against an optional source image. Iteration is over the
/// target's file-map keys in their canonical sorted order, so output order
/// is deterministic regardless of map-file authoring order.
pub struct TransfersManager<'a> {
    partition: &'a str,
    target: &'a Image,
    source: Option<&'a Image>,
}

impl<'a> TransfersManager<'a> {
    pub fn new(partition: &'a str, target: &'a Image, source: Option<&'a Image>) -> Self {
        TransfersManager {
            partition,
            target,
            source,
        }
    }

    pub fn classify(&self) -> Result<Vec<Action>, BuildError> {
        let mut actions = Vec::with_capacity(self.target.file_map().len());

        for (tgt_name, tgt_bs) in self.target.file_map() {
            if tgt_name == ZERO_KEY {
                actions.push(Action::zero(tgt_name.clone(), tgt_bs.clone()));
                continue;
            }

            let src_match = if tgt_name == COPY_KEY {
                // __COPY entries of the source are stash-eligible but never
                // selected as a diff source.
                None
            } else {
                self.source.and_then(|src| {
                    src.get(tgt_name)
                        .filter(|src_bs| src_bs.size() == tgt_bs.size())
                        .map(|src_bs| (src, src_bs))
                })
            };

            let action = match src_match {
                Some((src, src_bs)) => {
                    let aligned = src_bs.first(tgt_bs.size());
                    if aligned.is_empty() {
                        log::debug!(
                            "{}: {tgt_name} degrades to NEW (empty aligned source)",
                            self.partition
                        );
                        Action::new_action(tgt_name.clone(), tgt_bs.clone())
                    } else {
                        let tgt_hash = self.target.range_sha256(tgt_bs)?;
                        let src_hash = src.range_sha256(&aligned)?;
                        if src_hash == tgt_hash {
                            Action::moved(tgt_name.clone(), tgt_bs.clone(), tgt_name.clone(), aligned)
                        } else {
                            Action::diff(tgt_name.clone(), tgt_bs.clone(), tgt_name.clone(), aligned)
                        }
                    }
                }
                None => Action::new_action(tgt_name.clone(), tgt_bs.clone()),
            };

            actions.push(action);
        }

        log::info!(
            "{}: classified {} actions ({} blocks)",
            self.partition,
            actions.len(),
            self.target.care().size()
        );

        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_set::BlockSet;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn write_image(dir: &Path, name: &str, blocks: &[&[u8]]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        for b in blocks {
            f.write_all(b).unwrap();
        }
        path
    }

    #[test]
    fn all_zero_target_emits_zero_action_with_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let zero = vec![0u8; 4096];
        let tgt_path = write_image(dir.path(), "tgt.img", &[&zero, &zero]);
        let target = Image::open(&tgt_path, None::<&Path>, 4096).unwrap();

        let mgr = TransfersManager::new("system", &target, None);
        let actions = mgr.classify().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, crate::action::ActionType::Zero);
        assert_eq!(actions[0].tgt_blocks.size(), 2);
    }

    #[test]
    fn new_file_with_no_source_match() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0xAAu8; 4096];
        let tgt_path = write_image(dir.path(), "tgt.img", &[&data]);
        let target = Image::open(&tgt_path, None::<&Path>, 4096).unwrap();

        let mgr = TransfersManager::new("vendor", &target, None);
        let actions = mgr.classify().unwrap();
        assert!(actions
            .iter()
            .any(|a| a.action_type == crate::action::ActionType::New));
    }

    #[test]
    fn identical_named_ranges_classify_as_move() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0x11u8; 4096];
        let tgt_path = write_image(dir.path(), "tgt.img", &[&data]);
        let src_path = write_image(dir.path(), "src.img", &[&data]);

        let map_path = dir.path().join("shared.map");
        std::fs::write(&map_path, "app/data 2,0,1\n").unwrap();

        let target = Image::open(&tgt_path, Some(&map_path), 4096).unwrap();
        let source = Image::open(&src_path, Some(&map_path), 4096).unwrap();

        let mgr = TransfersManager::new("system", &target, Some(&source));
        let actions = mgr.classify().unwrap();
        let app = actions.iter().find(|a| a.tgt_name == "app/data").unwrap();
        assert_eq!(app.action_type, crate::action::ActionType::Move);
        assert_eq!(app.src_blocks, BlockSet::single_range(0, 1));
    }

    #[test]
    fn differing_named_ranges_classify_as_diff() {
        let dir = tempfile::tempdir().unwrap();
        let tgt_data = vec![0x22u8; 4096];
        let src_data = vec![0x33u8; 4096];
        let tgt_path = write_image(dir.path(), "tgt.img", &[&tgt_data]);
        let src_path = write_image(dir.path(), "src.img", &[&src_data]);

        let map_path = dir.path().join("shared.map");
        std::fs::write(&map_path, "app/data 2,0,1\n").unwrap();

        let target = Image::open(&tgt_path, Some(&map_path), 4096).unwrap();
        let source = Image::open(&src_path, Some(&map_path), 4096).unwrap();

        let mgr = TransfersManager::new("system", &target, Some(&source));
        let actions = mgr.classify().unwrap();
        let app = actions.iter().find(|a| a.tgt_name == "app/data").unwrap();
        assert_eq!(app.action_type, crate::action::ActionType::Diff);
    }
}
