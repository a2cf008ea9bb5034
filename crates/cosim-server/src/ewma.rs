//! Exponentially weighted moving average served over the cosim protocol.

use cosim_net::{Model, ModelError};

/// Name under which [`ewma`] is callable remotely.
pub const EWMA_FUNCTION: &str = "ewma";

/// One EWMA step: `(ma, bias_corrected)` for the previous average `prev`,
/// the current value `current`, smoothing factor `beta` and 1-based
/// iteration number `iter`.
pub fn ewma(prev: f64, current: f64, beta: f64, iter: i32) -> (f64, f64) {
    let ma = beta * prev + (1.0 - beta) * current;
    let bc = ma / (1.0 - beta.powi(iter));
    (ma, bc)
}

/// Stateful EWMA model.
///
/// Parameters are `[beta, initial_value]`. Until the first state update the
/// output is `initial_value`; afterwards it is the latest bias-corrected
/// average.
#[derive(Debug, Clone, PartialEq)]
pub struct EwmaModel {
    beta: f64,
    initial_value: f64,
    prev: f64,
    iter: i32,
    corrected: Option<f64>,
    last_input: Vec<f64>,
}

impl Default for EwmaModel {
    fn default() -> Self {
        Self::new(0.99, 0.0)
    }
}

impl EwmaModel {
    /// Model with the given parameters and fresh state.
    pub fn new(beta: f64, initial_value: f64) -> Self {
        Self {
            beta,
            initial_value,
            prev: 0.0,
            iter: 0,
            corrected: None,
            last_input: Vec::new(),
        }
    }

    /// Smoothing factor.
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Updates applied since the last initialization.
    pub fn iterations(&self) -> i32 {
        self.iter
    }

    /// Latest raw (not bias-corrected) average.
    pub fn average(&self) -> f64 {
        self.prev
    }

    fn single_input(inputs: &[f64]) -> Result<f64, ModelError> {
        match inputs {
            [u] => Ok(*u),
            _ => Err(ModelError::InputWidth {
                expected: 1,
                actual: inputs.len(),
            }),
        }
    }
}

impl Model for EwmaModel {
    fn set_parameters(&mut self, params: &[f64]) -> Result<(), ModelError> {
        let [beta, initial_value] = params else {
            return Err(ModelError::ParameterCount {
                expected: 2,
                actual: params.len(),
            });
        };
        if !(0.0..1.0).contains(beta) {
            return Err(ModelError::InvalidParameter {
                name: "beta",
                value: *beta,
            });
        }
        if !initial_value.is_finite() {
            return Err(ModelError::InvalidParameter {
                name: "initial_value",
                value: *initial_value,
            });
        }
        self.beta = *beta;
        self.initial_value = *initial_value;
        tracing::debug!(beta, initial_value, "ewma parameters set");
        Ok(())
    }

    fn initialize(&mut self) {
        self.prev = 0.0;
        self.iter = 0;
        self.corrected = None;
        self.last_input.clear();
    }

    fn compute_output(&mut self, _inputs: &[f64]) -> Result<Vec<f64>, ModelError> {
        Ok(vec![self.corrected.unwrap_or(self.initial_value)])
    }

    fn update_state(&mut self, inputs: &[f64]) -> Result<(), ModelError> {
        let u = Self::single_input(inputs)?;
        self.iter = self.iter.saturating_add(1);
        let (ma, bc) = ewma(self.prev, u, self.beta, self.iter);
        self.prev = ma;
        self.corrected = Some(bc);
        self.last_input = vec![u];
        Ok(())
    }

    fn terminate(&mut self) -> (Vec<f64>, Vec<f64>) {
        let bc = self.corrected.unwrap_or(self.initial_value);
        (self.last_input.clone(), vec![self.prev, bc])
    }

    fn functions(&self) -> Vec<String> {
        vec![EWMA_FUNCTION.to_string()]
    }

    fn call(&mut self, name: &str, args: &[f64]) -> Result<Vec<f64>, ModelError> {
        if name != EWMA_FUNCTION {
            return Err(ModelError::UnknownFunction(name.to_string()));
        }
        let [prev, current, beta, iter] = args else {
            return Err(ModelError::ArgumentCount {
                name: name.to_string(),
                expected: 4,
                actual: args.len(),
            });
        };
        // The iteration number travels as a double; truncate like an integer cast.
        let (ma, bc) = ewma(*prev, *current, *beta, *iter as i32);
        Ok(vec![ma, bc])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_ewma_first_step() {
        let (ma, bc) = ewma(0.0, 4.32, 0.99, 1);
        assert!(close(ma, 0.0432));
        assert!(close(bc, 4.32));
    }

    #[test]
    fn test_output_is_initial_value_before_first_update() {
        let mut model = EwmaModel::new(0.5, 7.0);
        model.initialize();
        assert_eq!(model.compute_output(&[1.0]).unwrap(), vec![7.0]);
    }

    #[test]
    fn test_updates_follow_bias_corrected_average() {
        let mut model = EwmaModel::new(0.5, 1.0);
        model.initialize();

        model.update_state(&[2.0]).unwrap();
        assert!(close(model.average(), 1.0));
        assert!(close(model.compute_output(&[]).unwrap()[0], 2.0));

        model.update_state(&[4.0]).unwrap();
        assert!(close(model.average(), 2.5));
        assert!(close(model.compute_output(&[]).unwrap()[0], 2.5 / 0.75));
        assert_eq!(model.iterations(), 2);
    }

    #[test]
    fn test_terminate_snapshot() {
        let mut model = EwmaModel::new(0.5, 1.0);
        model.initialize();
        model.update_state(&[2.0]).unwrap();

        let (u, y) = model.terminate();
        assert_eq!(u, vec![2.0]);
        assert!(close(y[0], 1.0));
        assert!(close(y[1], 2.0));
    }

    #[test]
    fn test_initialize_resets_state() {
        let mut model = EwmaModel::new(0.5, 3.0);
        model.update_state(&[2.0]).unwrap();
        model.initialize();
        assert_eq!(model.iterations(), 0);
        assert_eq!(model.compute_output(&[]).unwrap(), vec![3.0]);
    }

    #[test]
    fn test_parameters_validated() {
        let mut model = EwmaModel::default();
        assert!(matches!(
            model.set_parameters(&[0.9]),
            Err(ModelError::ParameterCount { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            model.set_parameters(&[-0.1, 0.0]),
            Err(ModelError::InvalidParameter { name: "beta", .. })
        ));
        assert!(model.set_parameters(&[1.0, 0.0]).is_err());
        model.set_parameters(&[0.8, 2.0]).unwrap();
        assert_eq!(model.beta(), 0.8);
    }

    #[test]
    fn test_update_requires_single_input() {
        let mut model = EwmaModel::default();
        assert!(matches!(
            model.update_state(&[1.0, 2.0]),
            Err(ModelError::InputWidth { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_function_call() {
        let mut model = EwmaModel::default();
        let out = model.call("ewma", &[0.0, 4.32, 0.99, 1.0]).unwrap();
        assert!(close(out[0], 0.0432));
        assert!(close(out[1], 4.32));
    }

    #[test]
    fn test_function_call_rejects_extra_arguments() {
        let mut model = EwmaModel::default();
        assert!(matches!(
            model.call("ewma", &[0.0, 1.0, 0.5, 1.0, 9.0]),
            Err(ModelError::ArgumentCount { expected: 4, actual: 5, .. })
        ));
        assert!(matches!(
            model.call("mean", &[]),
            Err(ModelError::UnknownFunction(_))
        ));
    }
}
