//! Event aggregator - fills every section through its routine chain

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::models::{AggregatedRecord, EventDescriptor, Section};
use crate::routines::Category;

use super::events::{EventBus, QueueEvent};
use super::resolver::{Candidate, RoutineChains};

/// Aggregates one event into a five-section record
pub struct Processor {
    chains: RoutineChains,
    events: Arc<EventBus>,
}

impl Processor {
    pub fn new(chains: RoutineChains, events: Arc<EventBus>) -> Self {
        Self { chains, events }
    }

    /// Capture every category; failing routines never abort the capture
    pub fn capture(&self, event: &EventDescriptor) -> AggregatedRecord {
        let mut record = AggregatedRecord::default();

        for category in Category::ALL {
            *record.section_mut(category) = self.capture_category(category, event);
        }

        record
    }

    fn capture_category(&self, category: Category, event: &EventDescriptor) -> Section {
        for candidate in self.chains.chain(category) {
            match self.invoke(candidate, category, event) {
                Some(section) if !section.is_empty() => {
                    trace!(provider = %candidate.provider, category = %category, "Routine answered");
                    return section;
                }
                _ => continue,
            }
        }
        Section::new()
    }

    fn invoke(&self, candidate: &Candidate, category: Category, event: &EventDescriptor) -> Option<Section> {
        let result = catch_unwind(AssertUnwindSafe(|| candidate.routines.collect(category, event)));

        let reason = match result {
            Ok(Ok(section)) => return Some(section),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "routine panicked".to_string()),
        };

        error!(
            provider = %candidate.provider,
            category = %category,
            event = %event.event,
            obj_id = event.obj_id,
            reason = %reason,
            "Capture routine failed, trying next candidate"
        );
        self.events.emit(QueueEvent::RoutineFailed {
            provider: candidate.provider.clone(),
            category,
            reason,
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::routines::{DataCaptureRoutines, RoutineOverrides};
    use serde_json::json;

    /// Answers every category with one marker value
    struct Fixed(&'static str);

    impl Fixed {
        fn section(&self) -> Result<Section, StorageError> {
            let mut section = Section::new();
            section.insert("source".into(), json!(self.0));
            Ok(section)
        }
    }

    impl DataCaptureRoutines for Fixed {
        fn collect_user_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { self.section() }
        fn collect_udf_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { self.section() }
        fn collect_member_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { self.section() }
        fn collect_lp_period(&self, _: &EventDescriptor) -> Result<Section, StorageError> { self.section() }
        fn collect_object_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { self.section() }
    }

    struct Empty;

    impl DataCaptureRoutines for Empty {
        fn collect_user_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
        fn collect_udf_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
        fn collect_member_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
        fn collect_lp_period(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
        fn collect_object_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
    }

    struct Broken;

    impl DataCaptureRoutines for Broken {
        fn collect_user_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> {
            Err(StorageError::Provider("user lookup exploded".into()))
        }
        fn collect_udf_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> {
            panic!("udf routine panicked")
        }
        fn collect_member_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
        fn collect_lp_period(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
        fn collect_object_data(&self, _: &EventDescriptor) -> Result<Section, StorageError> { Ok(Section::new()) }
    }

    fn source(section: &Section) -> Option<&str> {
        section.get("source").and_then(|v| v.as_str())
    }

    #[test]
    fn test_first_non_empty_candidate_wins() {
        let mut chains = RoutineChains::new(Arc::new(Fixed("default")));
        chains.push_override("A", Arc::new(Empty), RoutineOverrides::from_categories(&[Category::ObjectData]));
        chains.push_override("B", Arc::new(Fixed("B")), RoutineOverrides::from_categories(&[Category::ObjectData]));

        let record = Processor::new(chains, Arc::new(EventBus::new())).capture(&EventDescriptor::new("create"));

        assert_eq!(source(&record.object_data), Some("B"));
        assert_eq!(source(&record.user_data), Some("default"));
    }

    #[test]
    fn test_failing_candidate_falls_through() {
        let everything = RoutineOverrides::all();
        let mut chains = RoutineChains::new(Arc::new(Fixed("default")));
        chains.push_override("broken", Arc::new(Broken), everything);

        let bus = Arc::new(EventBus::new());
        let mut failures = bus.subscribe();
        let record = Processor::new(chains, bus).capture(&EventDescriptor::new("updateStatus"));

        for category in Category::ALL {
            assert_eq!(source(record.section(category)), Some("default"), "{}", category);
        }

        let mut failed = vec![];
        while let Ok(QueueEvent::RoutineFailed { category, .. }) = failures.try_recv() {
            failed.push(category);
        }
        assert_eq!(failed, vec![Category::UserData, Category::UdfData]);
    }

    #[test]
    fn test_all_empty_gives_empty_sections() {
        let chains = RoutineChains::new(Arc::new(Empty));
        let record = Processor::new(chains, Arc::new(EventBus::new())).capture(&EventDescriptor::new("create"));

        assert_eq!(record, AggregatedRecord::default());
    }
}
