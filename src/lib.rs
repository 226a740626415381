//! Workspace root. Holds the cross-service integration test suites under
//! `tests/integration/`; the deployable backend lives in `services/server`.
