use crate::Error;
use ndarray::{Array4, Zip};

/// Adam over a single tensor of parameters
pub(crate) struct Adam {
    pub(crate) learning_rate: f32,
    pub(crate) beta1: f32,
    pub(crate) beta2: f32,
    pub(crate) eps: f32,
    first_moment: Array4<f32>,
    second_moment: Array4<f32>,
    steps: i32,
}

impl Adam {
    pub(crate) fn new(learning_rate: f32, shape: (usize, usize, usize, usize)) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            first_moment: Array4::zeros(shape),
            second_moment: Array4::zeros(shape),
            steps: 0,
        }
    }

    pub(crate) fn step(&mut self, param: &mut Array4<f32>, grad: &Array4<f32>) -> Result<(), Error> {
        if param.dim() != self.first_moment.dim() || grad.dim() != param.dim() {
            return Err(Error::ShapeMismatch(
                grad.shape().to_vec(),
                self.first_moment.shape().to_vec(),
            ));
        }

        self.steps = self.steps.saturating_add(1);

        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.learning_rate);
        let bias1 = 1.0 - beta1.powi(self.steps);
        let bias2 = 1.0 - beta2.powi(self.steps);

        Zip::from(param)
            .and(grad)
            .and(&mut self.first_moment)
            .and(&mut self.second_moment)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });

        Ok(())
    }
}
