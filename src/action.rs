use crate::block_set::BlockSet;

/// One unit of work transforming a target block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Zero,
    New,
    Move,
    Diff,
}

/// A classified action before scheduling. `src_blocks` is empty for
/// `Zero`/`New`; `tgt_blocks.size() == src_blocks.size()` holds for
/// `Move`/`Diff`.
#[derive(Debug, Clone)]
pub struct Action {
    pub action_type: ActionType,
    pub tgt_name: String,
    pub tgt_blocks: BlockSet,
    pub src_name: String,
    pub src_blocks: BlockSet,
}

impl Action {
    pub fn zero(tgt_name: impl Into<String>, tgt_blocks: BlockSet) -> Self {
        Action {
            action_type: ActionType::Zero,
            tgt_name: tgt_name.into(),
            tgt_blocks,
            src_name: String::new(),
            src_blocks: BlockSet::empty(),
        }
    }

    pub fn new_action(tgt_name: impl Into<String>, tgt_blocks: BlockSet) -> Self {
        Action {
            action_type: ActionType::New,
            tgt_name: tgt_name.into(),
            tgt_blocks,
            src_name: String::new(),
            src_blocks: BlockSet::empty(),
        }
    }

    pub fn moved(
        tgt_name: impl Into<String>,
        tgt_blocks: BlockSet,
        src_name: impl Into<String>,
        src_blocks: BlockSet,
    ) -> Self {
        Action {
            action_type: ActionType::Move,
            tgt_name: tgt_name.into(),
            tgt_blocks,
            src_name: src_name.into(),
            src_blocks,
        }
    }

    pub fn diff(
        tgt_name: impl Into<String>,
        tgt_blocks: BlockSet,
        src_name: impl Into<String>,
        src_blocks: BlockSet,
    ) -> Self {
        Action {
            action_type: ActionType::Diff,
            tgt_name: tgt_name.into(),
            tgt_blocks,
            src_name: src_name.into(),
            src_blocks,
        }
    }
}
