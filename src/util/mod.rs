pub mod event_notifier;
