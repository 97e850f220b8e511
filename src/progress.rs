use std::fmt;

/// Stage milestones emitted by the pipeline, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    InputValidated,
    OutputPathResolved,
    ModelValidated,
    LayoutPrepared,
    ModelPathApplied,
    VroidMaterialPrepared,
    ReorderCompleted,
    BoneMappingCompleted,
    AStanceCompleted,
    MorphRenamePlanned {
        targets: usize,
        mappings: usize,
        planned: usize,
    },
    MorphRenameProcessed {
        processed: usize,
        total: usize,
    },
    MorphRenameCompleted,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::InputValidated => f.write_str("input validated"),
            ProgressEvent::OutputPathResolved => f.write_str("output path resolved"),
            ProgressEvent::ModelValidated => f.write_str("model validated"),
            ProgressEvent::LayoutPrepared => f.write_str("output layout prepared"),
            ProgressEvent::ModelPathApplied => f.write_str("model path applied"),
            ProgressEvent::VroidMaterialPrepared => f.write_str("VRoid materials prepared"),
            ProgressEvent::ReorderCompleted => f.write_str("material reorder completed"),
            ProgressEvent::BoneMappingCompleted => f.write_str("bone mapping completed"),
            ProgressEvent::AStanceCompleted => f.write_str("A-stance transfer completed"),
            ProgressEvent::MorphRenamePlanned {
                targets,
                mappings,
                planned,
            } => write!(
                f,
                "morph rename planned ({planned} of {targets} morphs, {mappings} dictionary entries)"
            ),
            ProgressEvent::MorphRenameProcessed { processed, total } => {
                write!(f, "morph rename {processed}/{total}")
            }
            ProgressEvent::MorphRenameCompleted => f.write_str("morph rename completed"),
        }
    }
}

/// Caller-provided sink for [`ProgressEvent`]s. Calls are synchronous.
pub trait ProgressReporter {
    fn report(&mut self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&mut self, _event: ProgressEvent) {}
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&mut self, event: ProgressEvent) {
        log::info!("{event}");
    }
}

impl<F: FnMut(ProgressEvent)> ProgressReporter for F {
    fn report(&mut self, event: ProgressEvent) {
        self(event)
    }
}
